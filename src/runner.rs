//! Agent Runner (spec §4.3): runs one external-agent CLI process end to
//! end for a feature, streaming its textual output, handling
//! cancellation, and persisting an append-only transcript.

use crate::provider::{AgentLine, AgentProvider, ProviderError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Grace period between a cancel signal and `Child::kill()` (spec §9
/// Open Question, resolved in DESIGN.md).
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("no such session: {0}")]
    SessionNotFound(String),
    #[error("session {0} already has a live process")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: String,
    pub transcript: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub cancelled: bool,
}

/// Events streamed to a subscriber while a session is live (spec §4.3,
/// §5 "no backpressure" — subscribers must keep up with an unbounded
/// channel).
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Started { feature_id: String },
    AssistantText { feature_id: String, text: String },
    ToolUse { feature_id: String, name: String, input: serde_json::Value },
    Log { feature_id: String, line: String },
    Completed { feature_id: String, outcome_summary: Option<String> },
    Cancelled { feature_id: String },
    Failed { feature_id: String, error: String },
}

pub type Subscriber = mpsc::UnboundedSender<RunnerEvent>;

pub struct RunConfig {
    pub feature_id: String,
    pub working_directory: PathBuf,
    pub prompt: String,
    pub image_paths: Vec<String>,
    pub provider: Arc<dyn AgentProvider>,
    pub subscriber: Option<Subscriber>,
    pub cancel_token: CancellationToken,
    /// Tool-Call Bridge loopback address and this run's authorization
    /// token (spec §4.4), threaded into the spawned process's environment.
    pub bridge_endpoint: String,
    pub run_token: String,
}

struct Session {
    feature_id: String,
    transcript_path: PathBuf,
    history: Mutex<Vec<Message>>,
    cancel_token: CancellationToken,
    provider: Arc<dyn AgentProvider>,
    working_directory: PathBuf,
    bridge_endpoint: String,
    run_token: String,
}

/// Detects a MIME type from a file extension for multipart image
/// attachment (spec §4.3 "Images").
pub fn mime_for_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

async fn encode_image(path: &str) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    Some(format!("data:{};base64,{}", mime_for_path(path), base64_encode(&bytes)))
}

/// Minimal base64 encoder (no padding surprises, standard alphabet) so
/// image attachment doesn't pull in a dedicated crate the rest of the
/// stack has no other use for.
fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32);
        out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(n >> 6 & 0x3f) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[(n & 0x3f) as usize] as char } else { '=' });
    }
    out
}

pub struct AgentRunner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunner {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    /// `run` (spec §4.3): spawns the agent, streams to the subscriber,
    /// persists the transcript, and resolves once the process exits or
    /// is cancelled.
    pub async fn run(&self, config: RunConfig) -> Result<RunOutcome, RunnerError> {
        if self.sessions.read().await.contains_key(&config.feature_id) {
            return Err(RunnerError::AlreadyRunning(config.feature_id));
        }

        let transcript_path = config.working_directory.join("agent-output.md");
        let session = Arc::new(Session {
            feature_id: config.feature_id.clone(),
            transcript_path: transcript_path.clone(),
            history: Mutex::new(vec![Message {
                role: Role::User,
                content: config.prompt.clone(),
                timestamp: chrono::Utc::now(),
            }]),
            cancel_token: config.cancel_token.clone(),
            provider: config.provider.clone(),
            working_directory: config.working_directory.clone(),
            bridge_endpoint: config.bridge_endpoint.clone(),
            run_token: config.run_token.clone(),
        });
        self.sessions.write().await.insert(config.feature_id.clone(), session.clone());

        let outcome = self
            .drive_process(&session, &config.prompt, &config.image_paths, config.subscriber.as_ref())
            .await;

        self.sessions.write().await.remove(&config.feature_id);
        outcome
    }

    /// `sendMessage` (spec §4.3): continues a prior session with a new
    /// turn. Coding-agent CLIs are one-shot processes, so "continuing"
    /// means spawning a fresh process whose prompt carries the prior
    /// transcript plus the new message (spec §4.5.3 follow-up/resume).
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        image_paths: &[String],
        subscriber: Option<Subscriber>,
    ) -> Result<RunOutcome, RunnerError> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RunnerError::SessionNotFound(session_id.to_string()))?;

        {
            let mut history = session.history.lock().await;
            history.push(Message { role: Role::User, content: message.to_string(), timestamp: chrono::Utc::now() });
        }

        let prior_transcript = tokio::fs::read_to_string(&session.transcript_path).await.unwrap_or_default();
        let prompt = format!("{prior_transcript}\n\n---\n\n{message}");

        self.drive_process(&session, &prompt, image_paths, subscriber.as_ref()).await
    }

    /// `stop` (spec §4.3): triggers cancellation; `drive_process` owns
    /// the kill-after-grace-period logic.
    pub async fn stop(&self, session_id: &str) -> Result<(), RunnerError> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RunnerError::SessionNotFound(session_id.to_string()))?;
        session.cancel_token.cancel();
        Ok(())
    }

    /// `getHistory` (spec §4.3).
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<Message>, RunnerError> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RunnerError::SessionNotFound(session_id.to_string()))?;
        Ok(session.history.lock().await.clone())
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    async fn drive_process(
        &self,
        session: &Arc<Session>,
        prompt: &str,
        image_paths: &[String],
        subscriber: Option<&Subscriber>,
    ) -> Result<RunOutcome, RunnerError> {
        let mut encoded_images = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            if let Some(encoded) = encode_image(path).await {
                encoded_images.push(encoded);
            }
        }

        let mut command = session.provider.build_command(
            &session.working_directory,
            prompt,
            image_paths,
            &session.bridge_endpoint,
            &session.run_token,
        );
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);

        let mut child: Child = command.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout).lines();

        if let Some(sub) = subscriber {
            let _ = sub.send(RunnerEvent::Started { feature_id: session.feature_id.clone() });
        }

        let mut transcript_buf = String::new();
        let mut tool_calls = Vec::new();
        let mut last_result: Option<String> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = session.cancel_token.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = reader.next_line() => {
                    match line? {
                        Some(raw) => {
                            self.handle_line(session, &raw, subscriber, &mut transcript_buf, &mut tool_calls, &mut last_result).await;
                        }
                        None => break,
                    }
                }
            }
        }

        if cancelled {
            drop(reader);
            let killed = tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await;
            if killed.is_err() {
                child.kill().await.ok();
            }
            if let Some(sub) = subscriber {
                let _ = sub.send(RunnerEvent::Cancelled { feature_id: session.feature_id.clone() });
            }
            self.append_transcript(session, &transcript_buf).await?;
            return Ok(RunOutcome { result: String::new(), transcript: transcript_buf, tool_calls, cancelled: true });
        }

        let status = child.wait().await?;
        self.append_transcript(session, &transcript_buf).await?;

        if !status.success() {
            let error = format!("agent process exited with status {status}");
            if let Some(sub) = subscriber {
                let _ = sub.send(RunnerEvent::Failed { feature_id: session.feature_id.clone(), error: error.clone() });
            }
            return Err(RunnerError::Io(std::io::Error::other(error)));
        }

        if let Some(sub) = subscriber {
            let _ = sub.send(RunnerEvent::Completed {
                feature_id: session.feature_id.clone(),
                outcome_summary: last_result.clone(),
            });
        }

        session.history.lock().await.push(Message {
            role: Role::Assistant,
            content: transcript_buf.clone(),
            timestamp: chrono::Utc::now(),
        });

        last_result.get_or_insert_with(|| transcript_buf.clone());
        Ok(RunOutcome { result: last_result.unwrap_or_default(), transcript: transcript_buf, tool_calls, cancelled: false })
    }

    async fn handle_line(
        &self,
        session: &Arc<Session>,
        raw: &str,
        subscriber: Option<&Subscriber>,
        transcript_buf: &mut String,
        tool_calls: &mut Vec<ToolCallRecord>,
        last_result: &mut Option<String>,
    ) {
        match session.provider.parse_line(raw) {
            AgentLine::AssistantText(text) => {
                transcript_buf.push_str(&text);
                transcript_buf.push('\n');
                if let Some(sub) = subscriber {
                    let _ = sub.send(RunnerEvent::AssistantText { feature_id: session.feature_id.clone(), text });
                }
            }
            AgentLine::ToolUse { name, input } => {
                tool_calls.push(ToolCallRecord { name: name.clone(), input: input.clone() });
                if let Some(sub) = subscriber {
                    let _ = sub.send(RunnerEvent::ToolUse { feature_id: session.feature_id.clone(), name, input });
                }
            }
            AgentLine::Result { summary, is_error } => {
                if is_error {
                    tracing::warn!(feature_id = %session.feature_id, "agent reported an error result");
                }
                if let Some(text) = summary {
                    transcript_buf.push_str(&text);
                    transcript_buf.push('\n');
                    *last_result = Some(text);
                }
            }
            AgentLine::Log(line) => {
                if let Some(sub) = subscriber {
                    let _ = sub.send(RunnerEvent::Log { feature_id: session.feature_id.clone(), line });
                }
            }
        }
    }

    /// Transcript persistence is append-only with buffered writes (spec §5).
    async fn append_transcript(&self, session: &Session, content: &str) -> Result<(), RunnerError> {
        if content.is_empty() {
            return Ok(());
        }
        if let Some(parent) = session.transcript_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&session.transcript_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::GenericProvider;

    #[test]
    fn mime_detection_covers_known_extensions() {
        assert_eq!(mime_for_path("a.png"), "image/png");
        assert_eq!(mime_for_path("a.JPG"), "image/jpeg");
        assert_eq!(mime_for_path("a.webp"), "image/webp");
        assert_eq!(mime_for_path("a.unknown"), "image/png");
    }

    #[test]
    fn base64_encodes_without_padding_surprises() {
        assert_eq!(base64_encode(b"a"), "YQ==");
        assert_eq!(base64_encode(b"ab"), "YWI=");
        assert_eq!(base64_encode(b"abc"), "YWJj");
    }

    #[tokio::test]
    async fn run_streams_events_and_persists_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let runner = AgentRunner::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let provider: Arc<dyn AgentProvider> = Arc::new(GenericProvider { command: "printf".into(), extra_args: vec!["hello-world".into()] });

        let outcome = runner
            .run(RunConfig {
                feature_id: "feat-1".into(),
                working_directory: dir.path().to_path_buf(),
                prompt: "do the thing".into(),
                image_paths: vec![],
                provider,
                subscriber: Some(tx),
                cancel_token: CancellationToken::new(),
                bridge_endpoint: String::new(),
                run_token: String::new(),
            })
            .await
            .unwrap();

        assert!(!outcome.cancelled);
        assert!(dir.path().join("agent-output.md").exists());

        let mut saw_started = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RunnerEvent::Started { .. }) {
                saw_started = true;
            }
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn stop_cancels_a_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(AgentRunner::new());
        let token = CancellationToken::new();

        let provider: Arc<dyn AgentProvider> = Arc::new(GenericProvider { command: "sleep".into(), extra_args: vec!["30".into()] });

        let runner2 = runner.clone();
        let token2 = token.clone();
        let dir_path = dir.path().to_path_buf();
        let handle = tokio::spawn(async move {
            runner2
                .run(RunConfig {
                    feature_id: "feat-stop".into(),
                    working_directory: dir_path,
                    prompt: "noop".into(),
                    image_paths: vec![],
                    provider,
                    subscriber: None,
                    cancel_token: token2,
                    bridge_endpoint: String::new(),
                    run_token: String::new(),
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop("feat-stop").await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.cancelled);
    }
}
