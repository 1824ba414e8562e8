//! Thin CLI wrapper around the `automaker` engine library: every
//! subcommand prints one `{success, error}` JSON envelope to stdout and
//! exits 0 on success, 2 for an unsupported provider, 1 for anything
//! else. No component other than this binary prints directly to
//! stdout/stderr.

use automaker::error::{CommandOutcome, EngineError};
use automaker::feature::FeatureDraft;
use automaker::worktree::SyncMethod;
use automaker::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "automaker", about = "Background engine for an agentic feature-implementation pipeline")]
struct Cli {
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold `.automaker/` and `automaker.toml` for a new project.
    Init {
        name: String,
        #[arg(long, default_value = "")]
        stack: String,
    },
    /// Start the engine, bind the Tool-Call Bridge, enable auto-mode, and block.
    Serve {
        #[arg(long, default_value_t = 4)]
        max_concurrency: usize,
    },
    /// Feature Store operations.
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },
    /// Run one feature end to end.
    Run { id: String },
    /// Run a narrower test-execution turn on an in-progress feature.
    Verify { id: String },
    /// Resume an in-progress feature with no live session.
    Resume { id: String },
    /// Continue a waiting_approval feature with a new message.
    FollowUp { id: String, message: String },
    /// Cancel a feature's live session.
    Stop { id: String },
    /// Merge and mark a feature verified using the project's merge strategy.
    Commit { id: String },
    /// Merge a feature's worktree with explicit options.
    Merge {
        id: String,
        #[arg(long)]
        squash: bool,
    },
    /// Revert a feature back to backlog, removing its worktree.
    Revert { id: String },
    /// Worktree inspection.
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Report auto-mode status.
    Status,
}

#[derive(Subcommand)]
enum FeatureAction {
    List,
    Show { id: String },
    Create {
        description: String,
        #[arg(long, default_value = "general")]
        category: String,
    },
    Update {
        id: String,
        #[arg(long)]
        description: Option<String>,
    },
    Rm { id: String },
}

#[derive(Subcommand)]
enum WorktreeAction {
    Status { id: String },
    Diff { id: String, path: Option<String> },
    List,
    Sync {
        id: String,
        #[arg(long, default_value = "rebase")]
        method: String,
    },
}

#[tokio::main]
async fn main() {
    automaker::init_tracing();
    let cli = Cli::parse();
    let (code, body) = run(cli).await;
    println!("{body}");
    std::process::exit(code);
}

async fn run(cli: Cli) -> (i32, String) {
    if let Command::Init { name, stack } = &cli.command {
        return render(Engine::init(&cli.project, name, stack).map(|_| serde_json::json!({})));
    }

    let engine = match Engine::open(cli.project.clone()).await {
        Ok(e) => e,
        Err(e) => return render(Err(e)),
    };

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Serve { max_concurrency } => {
            engine.orchestrator.start(max_concurrency).await;
            tokio::signal::ctrl_c().await.ok();
            engine.orchestrator.stop();
            engine.bridge.shutdown().await;
            render(Ok(serde_json::json!({})))
        }
        Command::Feature { action } => match action {
            FeatureAction::List => render(engine.store.list().await.map_err(EngineError::from).map(|f| serde_json::json!(f))),
            FeatureAction::Show { id } => render(
                engine
                    .store
                    .get(&id)
                    .await
                    .map_err(EngineError::from)
                    .and_then(|f| f.ok_or_else(|| EngineError::NotFound(id.clone())))
                    .map(|f| serde_json::json!(f)),
            ),
            FeatureAction::Create { description, category } => render(
                engine
                    .store
                    .create(FeatureDraft { description, category, ..Default::default() })
                    .await
                    .map_err(EngineError::from)
                    .map(|f| serde_json::json!(f)),
            ),
            FeatureAction::Update { id, description } => render(
                engine
                    .store
                    .update(&id, automaker::feature::FeatureUpdate { description, ..Default::default() })
                    .await
                    .map_err(EngineError::from)
                    .map(|f| serde_json::json!(f)),
            ),
            FeatureAction::Rm { id } => render(engine.store.delete(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        },
        Command::Run { id } => render(engine.orchestrator.run_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::Verify { id } => render(engine.orchestrator.verify_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::Resume { id } => render(engine.orchestrator.resume_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::FollowUp { id, message } => render(
            engine
                .orchestrator
                .follow_up_feature(&id, &message, vec![])
                .await
                .map_err(EngineError::from)
                .map(|_| serde_json::json!({})),
        ),
        Command::Stop { id } => render(engine.orchestrator.stop_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::Commit { id } => render(engine.orchestrator.commit_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::Merge { id, squash } => render(
            engine
                .orchestrator
                .merge_feature(&id, automaker::worktree::MergeOptions { squash, ..Default::default() })
                .await
                .map_err(EngineError::from)
                .map(|_| serde_json::json!({})),
        ),
        Command::Revert { id } => render(engine.orchestrator.revert_feature(&id).await.map_err(EngineError::from).map(|_| serde_json::json!({}))),
        Command::Worktree { action } => match action {
            WorktreeAction::Status { id } => {
                let result = async {
                    let record = engine
                        .worktrees
                        .get(&cli.project, &id)
                        .await
                        .map_err(EngineError::from)?
                        .ok_or_else(|| EngineError::NotFound(id.clone()))?;
                    let status = engine.worktrees.status(&record.path).await.map_err(EngineError::from)?;
                    Ok::<_, EngineError>(serde_json::json!({
                        "modifiedCount": status.modified_count,
                        "files": status.files,
                        "diffStat": status.diff_stat,
                        "recentCommits": status.recent_commits,
                    }))
                }
                .await;
                render(result)
            }
            WorktreeAction::Diff { id, path } => {
                let result = async {
                    let record = engine
                        .worktrees
                        .get(&cli.project, &id)
                        .await
                        .map_err(EngineError::from)?
                        .ok_or_else(|| EngineError::NotFound(id.clone()))?;
                    match path {
                        Some(p) => {
                            let diff = engine.worktrees.file_diff(&record.path, &p).await.map_err(EngineError::from)?;
                            Ok::<_, EngineError>(serde_json::json!({ "diff": diff }))
                        }
                        None => {
                            let diffs = engine.worktrees.all_file_diffs(&record.path).await.map_err(EngineError::from)?;
                            Ok::<_, EngineError>(serde_json::json!({
                                "diff": diffs.diff,
                                "hasChanges": diffs.has_changes,
                                "files": diffs.files.iter().map(|f| serde_json::json!({ "path": f.path, "status": f.status_text })).collect::<Vec<_>>(),
                            }))
                        }
                    }
                }
                .await;
                render(result)
            }
            WorktreeAction::List => render(
                engine
                    .worktrees
                    .list_all_feature_worktrees(&cli.project)
                    .await
                    .map_err(EngineError::from)
                    .map(|records| {
                        serde_json::json!(records
                            .into_iter()
                            .map(|r| serde_json::json!({ "featureId": r.feature_id, "path": r.path, "branch": r.branch }))
                            .collect::<Vec<_>>())
                    }),
            ),
            WorktreeAction::Sync { id, method } => {
                let method = if method == "merge" { SyncMethod::Merge } else { SyncMethod::Rebase };
                render(engine.orchestrator.sync_feature(&id, method).await.map_err(EngineError::from).map(|_| serde_json::json!({})))
            }
        },
        Command::Status => {
            let status = engine.orchestrator.status().await;
            render(Ok(serde_json::json!({
                "autoModeEnabled": status.auto_mode_enabled,
                "running": status.running,
                "maxConcurrency": status.max_concurrency,
            })))
        }
    }
}

fn render(result: Result<serde_json::Value, EngineError>) -> (i32, String) {
    match result {
        Ok(payload) => {
            let outcome = CommandOutcome::ok(payload);
            (0, serde_json::to_string(&outcome).unwrap_or_default())
        }
        Err(e) => {
            let code = e.exit_code();
            let outcome: CommandOutcome<()> = CommandOutcome::err(&e);
            (code, serde_json::to_string(&outcome).unwrap_or_default())
        }
    }
}
