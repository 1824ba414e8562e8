//! Supervised background tasks (spec §9 "mutable singletons → supervised
//! background tasks"): at most one live task per (project, task kind),
//! each independently cancellable. Covers suggestions generation, spec
//! regeneration, and project analysis — the Orchestrator's non-feature
//! background work.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Suggestions,
    SpecRegeneration,
    ProjectAnalysis,
}

#[derive(Debug, thiserror::Error)]
pub enum SingletonError {
    #[error("a {kind:?} task is already running for this project")]
    AlreadyRunning { kind: TaskKind },
}

struct Entry {
    token: CancellationToken,
}

/// Keyed by (project path, task kind); a project running its suggestions
/// task does not block a different project's, and the three task kinds
/// within one project never contend with each other.
#[derive(Default)]
pub struct SingletonRegistry {
    entries: RwLock<HashMap<(String, TaskKind), Entry>>,
}

/// RAII guard: dropping it (or calling `release` explicitly) removes the
/// registry entry so a later `try_start` for the same key succeeds.
pub struct TaskGuard<'a> {
    registry: &'a SingletonRegistry,
    key: (String, TaskKind),
    token: CancellationToken,
    released: bool,
}

impl TaskGuard<'_> {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn release(mut self) {
        self.registry.entries.write().await.remove(&self.key);
        self.released = true;
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = self.key.clone();
        if let Ok(mut entries) = self.registry.entries.try_write() {
            entries.remove(&key);
        }
    }
}

impl SingletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the (project, kind) slot or fails if one is already live.
    pub async fn try_start(&self, project: &str, kind: TaskKind) -> Result<TaskGuard<'_>, SingletonError> {
        let key = (project.to_string(), kind);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(SingletonError::AlreadyRunning { kind });
        }
        let token = CancellationToken::new();
        entries.insert(key.clone(), Entry { token: token.clone() });
        Ok(TaskGuard { registry: self, key, token, released: false })
    }

    pub async fn cancel(&self, project: &str, kind: TaskKind) {
        if let Some(entry) = self.entries.read().await.get(&(project.to_string(), kind)) {
            entry.token.cancel();
        }
    }

    pub async fn is_running(&self, project: &str, kind: TaskKind) -> bool {
        self.entries.read().await.contains_key(&(project.to_string(), kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_start_for_same_key_is_rejected() {
        let registry = SingletonRegistry::new();
        let guard = registry.try_start("proj-a", TaskKind::Suggestions).await.unwrap();

        let err = registry.try_start("proj-a", TaskKind::Suggestions).await.unwrap_err();
        assert!(matches!(err, SingletonError::AlreadyRunning { kind: TaskKind::Suggestions }));

        drop(guard);
    }

    #[tokio::test]
    async fn different_projects_and_kinds_do_not_contend() {
        let registry = SingletonRegistry::new();
        let _a = registry.try_start("proj-a", TaskKind::Suggestions).await.unwrap();
        let _b = registry.try_start("proj-b", TaskKind::Suggestions).await.unwrap();
        let _c = registry.try_start("proj-a", TaskKind::SpecRegeneration).await.unwrap();
    }

    #[tokio::test]
    async fn releasing_a_guard_frees_the_slot() {
        let registry = SingletonRegistry::new();
        let guard = registry.try_start("proj-a", TaskKind::ProjectAnalysis).await.unwrap();
        guard.release().await;

        assert!(!registry.is_running("proj-a", TaskKind::ProjectAnalysis).await);
        registry.try_start("proj-a", TaskKind::ProjectAnalysis).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_signals_the_guard_token() {
        let registry = SingletonRegistry::new();
        let guard = registry.try_start("proj-a", TaskKind::Suggestions).await.unwrap();
        let token = guard.cancellation_token();

        registry.cancel("proj-a", TaskKind::Suggestions).await;
        assert!(token.is_cancelled());
    }
}
