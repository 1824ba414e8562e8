//! Orchestrator (spec §4.5): owns the feature lifecycle and the
//! concurrency budget. The hardest component — selection policy, the
//! per-feature state machine (including plan-gating), the eight-step
//! run sequence, commit/merge/revert, and the singleton supervisor for
//! project-wide background tasks.

use crate::bridge::ToolCallBridge;
use crate::config::{MergeStrategy, ProjectConfig};
use crate::context::ContextReader;
use crate::events::{EngineEvent, EventBus};
use crate::feature::{Feature, FeatureError, FeatureStatus, FeatureStore, FeatureUpdate, PlanStatus};
use crate::provider::{resolve_provider, AgentProvider, ProviderError};
use crate::runner::{AgentRunner, RunConfig, RunnerError, Subscriber};
use crate::singleton::{SingletonError, SingletonRegistry, TaskKind};
use crate::worktree::{MergeOptions, SyncMethod, WorktreeError, WorktreeManager};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Singleton(#[from] SingletonError),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct AutoModeStatus {
    pub auto_mode_enabled: bool,
    pub running: Vec<String>,
    pub max_concurrency: usize,
}

struct RunningEntry {
    cancel_token: CancellationToken,
    /// Held for as long as the feature occupies a concurrency slot,
    /// including across a plan-gating pause (spec §4.5.3: "the
    /// Orchestrator releases its concurrency slot only when the caller
    /// explicitly cancels"). Dropping the entry releases the permit.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

pub struct Orchestrator {
    project_dir: PathBuf,
    config: ProjectConfig,
    store: Arc<FeatureStore>,
    worktrees: Arc<WorktreeManager>,
    runner: Arc<AgentRunner>,
    events: Arc<EventBus>,
    bridge: Arc<ToolCallBridge>,
    context: ContextReader,
    singletons: Arc<SingletonRegistry>,
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<String, RunningEntry>>>,
    auto_mode_enabled: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        project_dir: PathBuf,
        config: ProjectConfig,
        store: Arc<FeatureStore>,
        worktrees: Arc<WorktreeManager>,
        runner: Arc<AgentRunner>,
        events: Arc<EventBus>,
        bridge: Arc<ToolCallBridge>,
    ) -> Self {
        let max_concurrency = config.engine.max_concurrency;
        let context = ContextReader::new(&project_dir);
        Self {
            project_dir,
            config,
            store,
            worktrees,
            runner,
            events,
            bridge,
            context,
            singletons: Arc::new(SingletonRegistry::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            running: Arc::new(RwLock::new(HashMap::new())),
            auto_mode_enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `start` (spec §4.5.1): enables auto-mode and immediately fills
    /// up to `maxConcurrency` slots.
    pub async fn start(self: &Arc<Self>, max_concurrency: usize) {
        self.semaphore.add_permits(max_concurrency.saturating_sub(self.semaphore.available_permits()));
        self.auto_mode_enabled.store(true, Ordering::SeqCst);
        self.schedule_tick().await;
    }

    /// `stop` (spec §4.5.1): disables auto-mode; in-flight runs continue.
    pub fn stop(&self) {
        self.auto_mode_enabled.store(false, Ordering::SeqCst);
    }

    pub async fn status(&self) -> AutoModeStatus {
        AutoModeStatus {
            auto_mode_enabled: self.auto_mode_enabled.load(Ordering::SeqCst),
            running: self.running.read().await.keys().cloned().collect(),
            max_concurrency: self.config.engine.max_concurrency,
        }
    }

    /// Selection policy (spec §4.5.2): filters out running/terminal/
    /// dependency-blocked features, sorts by priority then creation
    /// time, and returns as many candidates as there are free slots.
    pub fn select_candidates(features: &[Feature], running: &[String], free_slots: usize) -> Vec<Feature> {
        let mut candidates: Vec<&Feature> = features
            .iter()
            .filter(|f| !running.contains(&f.id))
            .filter(|f| !f.status.is_terminal())
            .filter(|f| {
                f.dependencies.iter().all(|dep_id| {
                    features
                        .iter()
                        .find(|d| &d.id == dep_id)
                        .map(|d| d.status.satisfies_dependency())
                        .unwrap_or(false)
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            crate::feature::Priority::sort_key(a.priority)
                .cmp(&crate::feature::Priority::sort_key(b.priority))
                .then(a.created_at.cmp(&b.created_at))
        });

        candidates.into_iter().take(free_slots).cloned().collect()
    }

    async fn schedule_tick(self: &Arc<Self>) {
        if !self.auto_mode_enabled.load(Ordering::SeqCst) {
            return;
        }
        let features = match self.store.list().await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "failed to list features for scheduling tick");
                return;
            }
        };
        let running_ids: Vec<String> = self.running.read().await.keys().cloned().collect();
        let free_slots = self.semaphore.available_permits();
        let picked = Self::select_candidates(&features, &running_ids, free_slots);

        for feature in picked {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_feature(&feature.id).await {
                    tracing::error!(feature_id = %feature.id, error = %e, "run_feature failed");
                }
            });
        }
    }

    fn provider_for(&self, feature: &Feature) -> Result<Arc<dyn AgentProvider>, OrchestratorError> {
        let provider_name = self.config.engine.default_provider.clone();
        let model = feature.model.clone().or_else(|| self.config.engine.default_model.clone());
        Ok(Arc::from(resolve_provider(&provider_name, model)?))
    }

    /// Claims one of `maxConcurrency` slots and registers the feature
    /// as running; dropping the returned guard (via `finish_run`
    /// removing the map entry) releases the slot.
    async fn acquire_slot(&self, feature_id: &str, cancel_token: CancellationToken) -> Result<(), OrchestratorError> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::Conflict("no free concurrency slot".into()))?;
        self.running.write().await.insert(feature_id.to_string(), RunningEntry { cancel_token, _permit: permit });
        Ok(())
    }

    async fn build_prompt(&self, feature: &Feature, extra_context: Option<&str>) -> String {
        let app_spec = tokio::fs::read_to_string(self.project_dir.join(".automaker/app_spec.txt"))
            .await
            .unwrap_or_default();
        let images = feature.image_paths.iter().map(|p| p.path()).collect::<Vec<_>>().join(", ");
        let mut prompt = format!(
            "# Feature: {}\n\nCategory: {}\n\n{}\n",
            feature.description, feature.category, app_spec
        );
        if !images.is_empty() {
            prompt.push_str(&format!("\nAttached images: {images}\n"));
        }
        if let Ok(Some(user_context)) = self.context.read(&feature.id).await {
            prompt.push_str(&format!("\n---\n\n{user_context}\n"));
        }
        if let Some(extra) = extra_context {
            prompt.push_str(&format!("\n---\n\n{extra}\n"));
        }
        prompt
    }

    /// `runFeature`: the eight-step run sequence (spec §4.5.4).
    pub async fn run_feature(self: &Arc<Self>, feature_id: &str) -> Result<(), OrchestratorError> {
        let feature = self
            .store
            .get(feature_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;

        let cancel_token = CancellationToken::new();
        self.acquire_slot(feature_id, cancel_token.clone()).await?;

        self.store
            .update(feature_id, FeatureUpdate { status: Some(FeatureStatus::InProgress), started_at: Some(Some(chrono::Utc::now())), ..Default::default() })
            .await?;
        self.events.publish(EngineEvent::FeatureStarted { feature_id: feature_id.to_string() });

        if let Some(plan) = &feature.plan_spec {
            if plan.status != PlanStatus::Approved {
                self.run_plan_turn(&feature, cancel_token.clone()).await?;
                // Paused: slot stays occupied until explicit cancellation.
                return Ok(());
            }
        }

        let worktree_dir = if self.config.engine.worktrees_enabled {
            let created = self.worktrees.create(&self.project_dir, &feature).await?;
            self.store
                .update(
                    feature_id,
                    FeatureUpdate {
                        worktree_path: Some(Some(created.worktree_path.to_string_lossy().into_owned())),
                        branch_name: Some(Some(created.branch_name.clone())),
                        ..Default::default()
                    },
                )
                .await?;
            created.worktree_path
        } else {
            self.project_dir.clone()
        };

        let prompt = self.build_prompt(&feature, None).await;
        let provider = self.provider_for(&feature)?;
        let run_token = self.bridge.issue_token(feature_id).await;

        let outcome = self
            .runner
            .run(RunConfig {
                feature_id: feature_id.to_string(),
                working_directory: worktree_dir,
                prompt,
                image_paths: feature.image_paths.iter().map(|p| p.path().to_string()).collect(),
                provider,
                subscriber: self.subscriber_for(feature_id),
                cancel_token: cancel_token.clone(),
                bridge_endpoint: self.bridge.endpoint(),
                run_token: run_token.clone(),
            })
            .await;

        let result = self.finish_run(feature_id, outcome).await;
        self.bridge.revoke_token(&run_token).await;
        result
    }

    async fn run_plan_turn(&self, feature: &Feature, cancel_token: CancellationToken) -> Result<(), OrchestratorError> {
        let prompt = self.build_prompt(feature, Some("Produce an implementation plan only; do not write code yet.")).await;
        let provider = self.provider_for(feature)?;
        let working_directory = self.project_dir.clone();
        let run_token = self.bridge.issue_token(&feature.id).await;

        let outcome = self
            .runner
            .run(RunConfig {
                feature_id: feature.id.clone(),
                working_directory,
                prompt,
                image_paths: vec![],
                provider,
                subscriber: self.subscriber_for(&feature.id),
                cancel_token,
                bridge_endpoint: self.bridge.endpoint(),
                run_token: run_token.clone(),
            })
            .await;
        self.bridge.revoke_token(&run_token).await;
        let outcome = outcome?;

        let plan = feature.plan_spec.clone().map(|mut p| {
            p.status = PlanStatus::Generated;
            p.content = outcome.result.clone();
            p
        });
        self.store.update(&feature.id, FeatureUpdate { plan_spec: Some(plan), ..Default::default() }).await?;
        self.events.publish(EngineEvent::SpecRegenerationProgress {
            project: self.project_dir.to_string_lossy().into_owned(),
            message: "plan generated, awaiting approval".into(),
        });
        Ok(())
    }

    /// Approves a pending plan and resumes the run from scratch with
    /// `planSpec.status = approved`, freeing the paused slot first.
    pub async fn approve_plan(self: &Arc<Self>, feature_id: &str) -> Result<(), OrchestratorError> {
        let feature = self.store.get(feature_id).await?.ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;
        let mut plan = feature.plan_spec.ok_or_else(|| OrchestratorError::Invalid("feature has no plan to approve".into()))?;
        plan.status = PlanStatus::Approved;
        self.store.update(feature_id, FeatureUpdate { plan_spec: Some(Some(plan)), ..Default::default() }).await?;

        if !self.config.engine.reuse_worktree_on_approval && feature.worktree_path.is_some() {
            self.worktrees.remove(&self.project_dir, feature_id, true).await?;
            self.store
                .update(feature_id, FeatureUpdate { worktree_path: Some(None), branch_name: Some(None), ..Default::default() })
                .await?;
        }

        self.running.write().await.remove(feature_id);
        self.run_feature(feature_id).await
    }

    /// Ends a run started by `run_feature`/`verify_feature`/
    /// `resume_feature`/`follow_up_feature`: releases the concurrency
    /// slot, records the outcome, and — if auto-mode is still on — runs
    /// another scheduling tick so the slot just freed (and any feature
    /// whose dependency this one just satisfied) gets picked up without
    /// waiting for a fresh `start()` call (spec §4.5.4 step 8).
    async fn finish_run(self: &Arc<Self>, feature_id: &str, outcome: Result<crate::runner::RunOutcome, RunnerError>) -> Result<(), OrchestratorError> {
        self.running.write().await.remove(feature_id);

        let result = self.record_outcome(feature_id, outcome).await;
        self.schedule_tick().await;
        result
    }

    async fn record_outcome(&self, feature_id: &str, outcome: Result<crate::runner::RunOutcome, RunnerError>) -> Result<(), OrchestratorError> {
        match outcome {
            Ok(o) if o.cancelled => {
                self.events.publish(EngineEvent::FeatureAborted { feature_id: feature_id.to_string() });
            }
            Ok(o) => {
                // The agent may already have called update_feature_status
                // through the Tool-Call Bridge, which applies the
                // skipTests→waiting_approval coercion (spec §4.4) itself.
                // Only fall back to recomputing the status here if the
                // feature is still sitting at in_progress, i.e. no tool
                // call ever touched it.
                let feature = self.store.get(feature_id).await?;
                let status = match feature.as_ref().map(|f| f.status) {
                    Some(FeatureStatus::InProgress) | None => {
                        let skip_tests = feature.as_ref().and_then(|f| f.skip_tests).unwrap_or(false);
                        Some(if skip_tests { FeatureStatus::WaitingApproval } else { FeatureStatus::Verified })
                    }
                    Some(_) => None,
                };
                let summary = if feature.as_ref().and_then(|f| f.summary.clone()).is_some() {
                    None
                } else {
                    Some(Some(o.result.clone()))
                };
                self.store
                    .update(
                        feature_id,
                        FeatureUpdate { status, just_finished_at: Some(Some(chrono::Utc::now())), summary, ..Default::default() },
                    )
                    .await?;
                self.events.publish(EngineEvent::FeatureCompleted { feature_id: feature_id.to_string() });
            }
            Err(e) => {
                self.store
                    .update(feature_id, FeatureUpdate { error: Some(Some(e.to_string())), ..Default::default() })
                    .await?;
                self.events.publish(EngineEvent::FeatureErrored { feature_id: feature_id.to_string(), message: e.to_string() });
            }
        }

        Ok(())
    }

    fn subscriber_for(&self, feature_id: &str) -> Option<Subscriber> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let events = self.events.clone();
        let feature_id = feature_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match event {
                    crate::runner::RunnerEvent::AssistantText { feature_id, text } => EngineEvent::Stream { feature_id, text },
                    crate::runner::RunnerEvent::ToolUse { feature_id, name, .. } => EngineEvent::ToolUse { feature_id, name },
                    crate::runner::RunnerEvent::Completed { feature_id, outcome_summary } => EngineEvent::Complete { feature_id, summary: outcome_summary },
                    crate::runner::RunnerEvent::Failed { feature_id, error } => EngineEvent::Error { feature_id, message: error },
                    crate::runner::RunnerEvent::Cancelled { feature_id } => EngineEvent::FeatureAborted { feature_id },
                    crate::runner::RunnerEvent::Started { feature_id } => EngineEvent::FeatureStarted { feature_id },
                    crate::runner::RunnerEvent::Log { .. } => continue,
                };
                events.publish(mapped);
            }
            let _ = feature_id;
        });
        Some(tx)
    }

    /// `verifyFeature` (spec §4.5.5): requires `in_progress`; runs a
    /// narrower test-execution prompt.
    pub async fn verify_feature(self: &Arc<Self>, feature_id: &str) -> Result<(), OrchestratorError> {
        let feature = self.store.get(feature_id).await?.ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;
        if feature.status != FeatureStatus::InProgress {
            return Err(OrchestratorError::Invalid(format!("verifyFeature requires in_progress, got {:?}", feature.status)));
        }

        let worktree_dir = feature
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.project_dir.clone());
        let prompt = self.build_prompt(&feature, Some("Run the test suite and report pass/fail with a summary.")).await;
        let provider = self.provider_for(&feature)?;
        let cancel_token = CancellationToken::new();
        let run_token = self.bridge.issue_token(feature_id).await;

        let outcome = self
            .runner
            .run(RunConfig {
                feature_id: feature_id.to_string(),
                working_directory: worktree_dir,
                prompt,
                image_paths: vec![],
                provider,
                subscriber: self.subscriber_for(feature_id),
                cancel_token,
                bridge_endpoint: self.bridge.endpoint(),
                run_token: run_token.clone(),
            })
            .await;
        let result = self.finish_run(feature_id, outcome).await;
        self.bridge.revoke_token(&run_token).await;
        result
    }

    /// `resumeFeature` (spec §4.5.5): requires `in_progress`, no live
    /// session, non-empty transcript.
    pub async fn resume_feature(self: &Arc<Self>, feature_id: &str) -> Result<(), OrchestratorError> {
        let feature = self.store.get(feature_id).await?.ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;
        if feature.status != FeatureStatus::InProgress {
            return Err(OrchestratorError::Invalid("resumeFeature requires in_progress".into()));
        }
        if self.running.read().await.contains_key(feature_id) {
            return Err(OrchestratorError::Conflict("feature already has a live session".into()));
        }
        let transcript = self.store.get_agent_output(feature_id).await?;
        let transcript = transcript.filter(|t| !t.is_empty()).ok_or_else(|| OrchestratorError::Invalid("no prior transcript to resume from".into()))?;

        let worktree_dir = feature
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.project_dir.clone());
        let prompt = self.build_prompt(&feature, Some(&format!("Resume from the prior transcript:\n\n{transcript}"))).await;
        let provider = self.provider_for(&feature)?;
        let cancel_token = CancellationToken::new();
        self.acquire_slot(feature_id, cancel_token.clone()).await?;
        let run_token = self.bridge.issue_token(feature_id).await;

        let outcome = self
            .runner
            .run(RunConfig {
                feature_id: feature_id.to_string(),
                working_directory: worktree_dir,
                prompt,
                image_paths: vec![],
                provider,
                subscriber: self.subscriber_for(feature_id),
                cancel_token,
                bridge_endpoint: self.bridge.endpoint(),
                run_token: run_token.clone(),
            })
            .await;
        let result = self.finish_run(feature_id, outcome).await;
        self.bridge.revoke_token(&run_token).await;
        result
    }

    /// `followUpFeature` (spec §4.5.5): requires `waiting_approval`.
    pub async fn follow_up_feature(self: &Arc<Self>, feature_id: &str, prompt_text: &str, image_paths: Vec<String>) -> Result<(), OrchestratorError> {
        let feature = self.store.get(feature_id).await?.ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;
        if feature.status != FeatureStatus::WaitingApproval {
            return Err(OrchestratorError::Invalid("followUpFeature requires waiting_approval".into()));
        }

        self.store.update(feature_id, FeatureUpdate { status: Some(FeatureStatus::InProgress), ..Default::default() }).await?;

        let transcript = self.store.get_agent_output(feature_id).await?.unwrap_or_default();
        let worktree_dir = feature
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.project_dir.clone());
        let prompt = format!("{transcript}\n\n---\n\n{prompt_text}");
        let provider = self.provider_for(&feature)?;
        let cancel_token = CancellationToken::new();
        self.acquire_slot(feature_id, cancel_token.clone()).await?;
        let run_token = self.bridge.issue_token(feature_id).await;

        let outcome = self
            .runner
            .run(RunConfig {
                feature_id: feature_id.to_string(),
                working_directory: worktree_dir,
                prompt,
                image_paths,
                provider,
                subscriber: self.subscriber_for(feature_id),
                cancel_token,
                bridge_endpoint: self.bridge.endpoint(),
                run_token: run_token.clone(),
            })
            .await;
        let result = self.finish_run(feature_id, outcome).await;
        self.bridge.revoke_token(&run_token).await;
        result
    }

    /// `stopFeature` (spec §4.5.1, §5 "Cancellation"): completes
    /// synchronously from the caller's view; teardown is observed via
    /// the subscriber.
    pub async fn stop_feature(&self, feature_id: &str) -> Result<(), OrchestratorError> {
        let running = self.running.read().await;
        let entry = running.get(feature_id).ok_or_else(|| OrchestratorError::NotFound(feature_id.to_string()))?;
        entry.cancel_token.cancel();
        self.runner.stop(feature_id).await.ok();
        Ok(())
    }

    /// `commitFeature` (spec §4.5.6).
    pub async fn commit_feature(&self, feature_id: &str) -> Result<(), OrchestratorError> {
        let squash = self.config.engine.merge_strategy == MergeStrategy::Squash;
        self.worktrees
            .merge(&self.project_dir, feature_id, MergeOptions { squash, cleanup: false, ..Default::default() })
            .await?;
        self.store.set_status(feature_id, FeatureStatus::Verified, None, None).await?;
        Ok(())
    }

    /// `mergeFeature` (spec §4.5.6): thin pass-through with event streaming.
    pub async fn merge_feature(&self, feature_id: &str, options: MergeOptions) -> Result<(), OrchestratorError> {
        self.worktrees.merge(&self.project_dir, feature_id, options).await?;
        self.events.publish(EngineEvent::FeatureCompleted { feature_id: feature_id.to_string() });
        Ok(())
    }

    pub async fn sync_feature(&self, feature_id: &str, method: SyncMethod) -> Result<(), OrchestratorError> {
        self.worktrees.sync(&self.project_dir, feature_id, method).await?;
        Ok(())
    }

    /// `revertFeature` (spec §4.5.6).
    pub async fn revert_feature(&self, feature_id: &str) -> Result<(), OrchestratorError> {
        self.worktrees.remove(&self.project_dir, feature_id, true).await?;
        self.store
            .update(
                feature_id,
                FeatureUpdate {
                    status: Some(FeatureStatus::Backlog),
                    started_at: Some(None),
                    just_finished_at: Some(None),
                    summary: Some(None),
                    error: Some(None),
                    worktree_path: Some(None),
                    branch_name: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// `analyzeProject` (spec §4.5.1, §4.5.7): singleton-guarded
    /// background task; a second concurrent call is rejected.
    pub async fn analyze_project(&self) -> Result<(), OrchestratorError> {
        let project = self.project_dir.to_string_lossy().into_owned();
        let guard = self.singletons.try_start(&project, TaskKind::ProjectAnalysis).await?;

        self.events.publish(EngineEvent::AutoModeTaskStarted { task_kind: "project_analysis".into(), project: project.clone() });
        let features = self.store.list().await?;
        tracing::info!(count = features.len(), "analyzed project features");
        self.events.publish(EngineEvent::AutoModeTaskComplete { task_kind: "project_analysis".into(), project });

        guard.release().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Priority;
    use chrono::Utc;

    fn feature(id: &str, status: FeatureStatus, priority: Option<Priority>, deps: Vec<&str>, age_secs: i64) -> Feature {
        Feature {
            id: id.into(),
            description: id.into(),
            category: "cat".into(),
            priority,
            dependencies: deps.into_iter().map(String::from).collect(),
            status,
            skip_tests: None,
            model: None,
            thinking_level: None,
            reasoning_effort: None,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
            started_at: None,
            just_finished_at: None,
            summary: None,
            error: None,
            worktree_path: None,
            branch_name: None,
            image_paths: vec![],
            plan_spec: None,
        }
    }

    #[test]
    fn selection_sorts_by_priority_then_age() {
        let features = vec![
            feature("low", FeatureStatus::Backlog, Some(Priority::Low), vec![], 100),
            feature("high", FeatureStatus::Backlog, Some(Priority::High), vec![], 1),
            feature("unset-old", FeatureStatus::Backlog, None, vec![], 200),
        ];
        let picked = Orchestrator::select_candidates(&features, &[], 3);
        assert_eq!(picked.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), vec!["high", "unset-old", "low"]);
    }

    #[test]
    fn selection_respects_free_slot_count() {
        let features = vec![
            feature("a", FeatureStatus::Backlog, None, vec![], 10),
            feature("b", FeatureStatus::Backlog, None, vec![], 5),
            feature("c", FeatureStatus::Backlog, None, vec![], 1),
        ];
        let picked = Orchestrator::select_candidates(&features, &[], 2);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn selection_skips_dependency_blocked_features() {
        let features = vec![
            feature("base", FeatureStatus::InProgress, None, vec![], 10),
            feature("dependent", FeatureStatus::Backlog, None, vec!["base"], 5),
        ];
        let picked = Orchestrator::select_candidates(&features, &[], 5);
        assert!(picked.is_empty());
    }

    #[test]
    fn selection_skips_already_running_and_terminal_features() {
        let features = vec![
            feature("running", FeatureStatus::Backlog, None, vec![], 10),
            feature("done", FeatureStatus::Verified, None, vec![], 5),
            feature("eligible", FeatureStatus::Backlog, None, vec![], 1),
        ];
        let picked = Orchestrator::select_candidates(&features, &["running".to_string()], 5);
        assert_eq!(picked.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), vec!["eligible"]);
    }

    #[test]
    fn dependency_satisfied_by_archived_unblocks_dependent() {
        let features = vec![
            feature("base", FeatureStatus::Archived, None, vec![], 10),
            feature("dependent", FeatureStatus::Backlog, None, vec!["base"], 5),
        ];
        let picked = Orchestrator::select_candidates(&features, &[], 5);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "dependent");
    }
}
