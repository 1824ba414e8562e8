use automaker::feature::{Feature, FeatureDraft, FeatureStatus, FeatureStore, Priority};
use automaker::scheduler::Orchestrator;
use automaker::worktree::WorktreeManager;
use automaker::Engine;
use std::process::Command;
use tempfile::TempDir;

fn init_git_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    Command::new("git").current_dir(dir.path()).args(["init"]).output().unwrap();
    Command::new("git").current_dir(dir.path()).args(["config", "user.email", "test@example.com"]).output().unwrap();
    Command::new("git").current_dir(dir.path()).args(["config", "user.name", "Test User"]).output().unwrap();
    std::fs::write(dir.path().join("README.md"), "# test project").unwrap();
    Command::new("git").current_dir(dir.path()).args(["add", "."]).output().unwrap();
    Command::new("git").current_dir(dir.path()).args(["commit", "-m", "initial"]).output().unwrap();
    dir
}

#[tokio::test]
async fn init_then_open_scaffolds_a_loadable_config() {
    let dir = TempDir::new().unwrap();
    Engine::init(dir.path(), "demo-app", "Rust, axum").unwrap();

    let engine = Engine::open(dir.path().to_path_buf()).await.unwrap();
    assert!(dir.path().join(".automaker/features").is_dir());
    assert!(dir.path().join("automaker.toml").exists());
    assert_eq!(engine.project_dir, dir.path());
}

#[tokio::test]
async fn feature_crud_round_trips_through_the_store() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::new(dir.path());

    let created = store
        .create(FeatureDraft {
            description: "add retry logic".into(),
            category: "reliability".into(),
            priority: Some(Priority::High),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.status, FeatureStatus::Backlog);

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);

    let fetched = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(fetched.description, "add retry logic");

    store.delete(&created.id).await.unwrap();
    assert!(store.get(&created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn worktree_create_is_idempotent_then_revert_removes_it() {
    let dir = init_git_repo();
    let store = FeatureStore::new(dir.path());
    let worktrees = WorktreeManager::new();

    let feature = store
        .create(FeatureDraft { description: "hook up metrics".into(), category: "ops".into(), ..Default::default() })
        .await
        .unwrap();

    let first = worktrees.create(dir.path(), &feature).await.unwrap();
    let second = worktrees.create(dir.path(), &feature).await.unwrap();
    assert_eq!(first.worktree_path, second.worktree_path);
    assert!(second.preexisting);
    assert!(first.worktree_path.is_dir());

    let config = automaker::config::ProjectConfig::scaffold("demo", "Rust");
    let store = std::sync::Arc::new(store);
    let (bridge, _bridge_task) = automaker::bridge::ToolCallBridge::spawn(store.clone()).await.unwrap();
    let orchestrator = Orchestrator::new(
        dir.path().to_path_buf(),
        config,
        store,
        std::sync::Arc::new(worktrees),
        std::sync::Arc::new(automaker::runner::AgentRunner::new()),
        std::sync::Arc::new(automaker::events::EventBus::new()),
        bridge,
    );

    orchestrator.revert_feature(&feature.id).await.unwrap();
    assert!(!first.worktree_path.exists());
}

/// Exercises spec §4.5.4 step 8: once auto-mode's initial tick
/// completes, a freed concurrency slot must be re-evaluated rather than
/// leaving later backlog features stranded. With `max_concurrency = 1`
/// and no `claude` binary on PATH, the first feature's run fails fast at
/// spawn time, which should free its slot and trigger a second tick that
/// picks up the second feature.
#[tokio::test]
async fn auto_mode_retriggers_scheduling_once_a_run_finishes() {
    let dir = init_git_repo();
    let store = FeatureStore::new(dir.path());

    let first = store.create(FeatureDraft { description: "first in line".into(), category: "cat".into(), ..Default::default() }).await.unwrap();
    let second = store.create(FeatureDraft { description: "second in line".into(), category: "cat".into(), ..Default::default() }).await.unwrap();

    let mut config = automaker::config::ProjectConfig::scaffold("demo", "Rust");
    config.engine.max_concurrency = 1;

    let store = std::sync::Arc::new(store);
    let (bridge, _bridge_task) = automaker::bridge::ToolCallBridge::spawn(store.clone()).await.unwrap();
    let orchestrator = std::sync::Arc::new(Orchestrator::new(
        dir.path().to_path_buf(),
        config,
        store.clone(),
        std::sync::Arc::new(WorktreeManager::new()),
        std::sync::Arc::new(automaker::runner::AgentRunner::new()),
        std::sync::Arc::new(automaker::events::EventBus::new()),
        bridge,
    ));

    orchestrator.start(1).await;

    let mut both_left_backlog = false;
    for _ in 0..100 {
        let a = store.get(&first.id).await.unwrap().unwrap().status;
        let b = store.get(&second.id).await.unwrap().unwrap().status;
        if a != FeatureStatus::Backlog && b != FeatureStatus::Backlog {
            both_left_backlog = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(both_left_backlog, "the second feature should start once the first feature's run frees its concurrency slot");
}

#[tokio::test]
async fn selection_policy_skips_a_feature_whose_dependency_is_unmet() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::new(dir.path());

    let base = store
        .create(FeatureDraft { description: "base migration".into(), category: "db".into(), ..Default::default() })
        .await
        .unwrap();
    let dependent = store
        .create(FeatureDraft {
            description: "feature flag rollout".into(),
            category: "platform".into(),
            dependencies: vec![base.id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();

    let features: Vec<Feature> = store.list().await.unwrap();
    let picked = Orchestrator::select_candidates(&features, &[], 10);
    let picked_ids: Vec<&str> = picked.iter().map(|f| f.id.as_str()).collect();

    assert!(picked_ids.contains(&base.id.as_str()));
    assert!(!picked_ids.contains(&dependent.id.as_str()));
}
