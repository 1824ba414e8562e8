//! Agent provider capability + variants (spec §4.3, §9 "capability +
//! variants"): each supported coding-agent CLI gets a typed impl of
//! [`AgentProvider`] instead of a string match with a silent fallback arm.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A single line parsed from the agent's NDJSON stdout stream (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentLine {
    AssistantText(String),
    ToolUse { name: String, input: serde_json::Value },
    Result { summary: Option<String>, is_error: bool },
    Log(String),
}

/// Capability trait: builds the subprocess command and parses its output.
/// Implementations hold no state beyond construction parameters — the
/// runner owns the process handle and lifetime.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds the `tokio::process::Command` to run in `worktree_dir`,
    /// asking the agent to work on `prompt` and, if non-empty,
    /// attaching `image_paths` as additional input. `bridge_endpoint`
    /// and `run_token` are the Tool-Call Bridge's loopback address and
    /// this run's authorization token, passed through as environment
    /// variables so the agent process can call back into it.
    fn build_command(
        &self,
        worktree_dir: &Path,
        prompt: &str,
        image_paths: &[String],
        bridge_endpoint: &str,
        run_token: &str,
    ) -> Command;

    /// Parses one line of the agent's stdout into a structured event.
    /// Lines that don't match a known shape pass through as `Log`.
    fn parse_line(&self, line: &str) -> AgentLine;
}

pub struct ClaudeProvider {
    pub model: Option<String>,
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(
        &self,
        worktree_dir: &Path,
        prompt: &str,
        image_paths: &[String],
        bridge_endpoint: &str,
        run_token: &str,
    ) -> Command {
        let mut cmd = Command::new("claude");
        cmd.current_dir(worktree_dir)
            .env("AUTOMAKER_BRIDGE_URL", bridge_endpoint)
            .env("AUTOMAKER_RUN_TOKEN", run_token)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        for image in image_paths {
            cmd.arg("--attach").arg(image);
        }
        cmd
    }

    fn parse_line(&self, line: &str) -> AgentLine {
        parse_claude_style_json(line)
    }
}

pub struct CodexProvider {
    pub model: Option<String>,
}

#[async_trait]
impl AgentProvider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(
        &self,
        worktree_dir: &Path,
        prompt: &str,
        image_paths: &[String],
        bridge_endpoint: &str,
        run_token: &str,
    ) -> Command {
        let mut cmd = Command::new("codex");
        cmd.current_dir(worktree_dir)
            .env("AUTOMAKER_BRIDGE_URL", bridge_endpoint)
            .env("AUTOMAKER_RUN_TOKEN", run_token)
            .arg("exec")
            .arg("--json")
            .arg(prompt);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        for image in image_paths {
            cmd.arg("--image").arg(image);
        }
        cmd
    }

    fn parse_line(&self, line: &str) -> AgentLine {
        parse_claude_style_json(line)
    }
}

/// A minimal line-oriented provider for CLIs with no structured output
/// contract: every stdout line becomes a log line, every run resolves.
pub struct GenericProvider {
    pub command: String,
    pub extra_args: Vec<String>,
}

#[async_trait]
impl AgentProvider for GenericProvider {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn build_command(
        &self,
        worktree_dir: &Path,
        prompt: &str,
        _image_paths: &[String],
        bridge_endpoint: &str,
        run_token: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.current_dir(worktree_dir)
            .env("AUTOMAKER_BRIDGE_URL", bridge_endpoint)
            .env("AUTOMAKER_RUN_TOKEN", run_token)
            .args(&self.extra_args)
            .arg(prompt);
        cmd
    }

    fn parse_line(&self, line: &str) -> AgentLine {
        AgentLine::Log(line.to_string())
    }
}

fn parse_claude_style_json(line: &str) -> AgentLine {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return AgentLine::Log(line.to_string());
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let text = value
                .pointer("/message/content/0/text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            AgentLine::AssistantText(text)
        }
        Some("tool_use") => {
            let name = value.get("name").and_then(|n| n.as_str()).unwrap_or("unknown").to_string();
            let input = value.get("input").cloned().unwrap_or(serde_json::Value::Null);
            AgentLine::ToolUse { name, input }
        }
        Some("result") => {
            let summary = value.get("result").and_then(|r| r.as_str()).map(str::to_string);
            let is_error = value.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);
            AgentLine::Result { summary, is_error }
        }
        _ => AgentLine::Log(line.to_string()),
    }
}

/// Resolves a provider name to a concrete implementation. Returns
/// [`ProviderError::UnsupportedProvider`] for anything else instead of
/// silently treating an unknown name as generic (spec §6, CLI exit code 2).
pub fn resolve_provider(name: &str, model: Option<String>) -> Result<Box<dyn AgentProvider>, ProviderError> {
    match name {
        "claude" => Ok(Box::new(ClaudeProvider { model })),
        "codex" => Ok(Box::new(CodexProvider { model })),
        other => Err(ProviderError::UnsupportedProvider(other.to_string())),
    }
}
