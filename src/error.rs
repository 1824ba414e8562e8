//! Crate-level error taxonomy (spec §7): NotFound, Invalid, Conflict,
//! External, Cancelled, Io. Every public engine method returns
//! `Result<T, EngineError>`; the CLI layer is the only place that turns
//! this into human-readable text and an exit code.

use crate::bridge::BridgeError;
use crate::feature::FeatureError;
use crate::provider::ProviderError;
use crate::runner::RunnerError;
use crate::scheduler::OrchestratorError;
use crate::worktree::WorktreeError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("external failure: {0}")]
    External(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl EngineError {
    /// Exit code mapping used by the CLI layer: 0 never reaches here,
    /// 1 is the default, 2 is reserved for an unsupported provider.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Provider(ProviderError::UnsupportedProvider(_)) => 2,
            EngineError::Orchestrator(OrchestratorError::Provider(ProviderError::UnsupportedProvider(_))) => 2,
            _ => 1,
        }
    }
}

/// The transport-neutral `{success, error}` envelope from spec §7.
#[derive(Debug, serde::Serialize)]
pub struct CommandOutcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> CommandOutcome<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(e: &EngineError) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(e.to_string()),
        }
    }
}
