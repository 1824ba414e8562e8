//! Background engine that drives a feature board through an agentic
//! implementation pipeline: a Feature Store, a Worktree Manager, an
//! Agent Runner, a Tool-Call Bridge, and an Orchestrator tying them
//! together behind one library boundary the CLI (or any other outer
//! shell) drives over the command surface in [`error::CommandOutcome`].

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod feature;
pub mod provider;
pub mod runner;
pub mod scheduler;
pub mod singleton;
pub mod worktree;

pub use error::EngineError;

use std::path::PathBuf;
use std::sync::Arc;

/// Wires one project's Feature Store, Worktree Manager, Agent Runner,
/// Tool-Call Bridge, event bus, and Orchestrator together. One `Engine`
/// per open project.
pub struct Engine {
    pub project_dir: PathBuf,
    pub store: Arc<feature::FeatureStore>,
    pub worktrees: Arc<worktree::WorktreeManager>,
    pub runner: Arc<runner::AgentRunner>,
    pub events: Arc<events::EventBus>,
    pub bridge: Arc<bridge::ToolCallBridge>,
    pub orchestrator: Arc<scheduler::Orchestrator>,
}

impl Engine {
    pub async fn open(project_dir: PathBuf) -> Result<Self, EngineError> {
        let config = config::ProjectConfig::load(&project_dir).unwrap_or_else(|_| {
            let name = project_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            config::ProjectConfig::scaffold(&name, "")
        });

        let store = Arc::new(feature::FeatureStore::new(&project_dir));
        let worktrees = Arc::new(worktree::WorktreeManager::new());
        let runner = Arc::new(runner::AgentRunner::new());
        let events = Arc::new(events::EventBus::new());
        let (bridge, _bridge_task) = bridge::ToolCallBridge::spawn(store.clone()).await?;
        tracing::info!(endpoint = %bridge.endpoint(), "tool-call bridge listening");
        let orchestrator = Arc::new(scheduler::Orchestrator::new(
            project_dir.clone(),
            config,
            store.clone(),
            worktrees.clone(),
            runner.clone(),
            events.clone(),
            bridge.clone(),
        ));

        Ok(Self { project_dir, store, worktrees, runner, events, bridge, orchestrator })
    }

    /// Scaffolds a new project's `.automaker/` directory and `automaker.toml`.
    pub fn init(project_dir: &std::path::Path, name: &str, stack: &str) -> Result<(), EngineError> {
        std::fs::create_dir_all(project_dir.join(".automaker/features"))?;
        config::ProjectConfig::scaffold(name, stack)
            .save(project_dir)
            .map_err(|e| EngineError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Initializes structured logging the way the rest of the crate expects
/// (spec's ambient "observability" concern): `RUST_LOG`-driven filter,
/// human-readable output, no direct stdout/stderr writes from library code.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
