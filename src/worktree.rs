//! Worktree Manager (spec §4.2): one isolated git worktree per feature
//! under `<project>/.automaker/worktrees/`, with status/diff/merge/sync/
//! cleanup on top of the plain `git worktree` plumbing.

use crate::feature::Feature;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::RwLock;
use tokio::task;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git invocation failed: {0}")]
    Git(String),
    #[error("worktree not found for feature {0}")]
    NotFound(String),
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("background task panicked: {0}")]
    Join(#[from] task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeRecord {
    pub feature_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeCreateResult {
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
    pub preexisting: bool,
}

#[derive(Debug, Clone)]
pub struct WorktreeStatus {
    pub modified_count: usize,
    pub files: Vec<String>,
    pub diff_stat: String,
    pub recent_commits: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FileDiffEntry {
    pub path: String,
    pub status: char,
    pub status_text: &'static str,
}

#[derive(Debug, Clone)]
pub struct AllFileDiffs {
    pub diff: String,
    pub files: Vec<FileDiffEntry>,
    pub has_changes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub squash: bool,
    pub squash_message: Option<String>,
    pub commit_message: Option<String>,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    Rebase,
    Merge,
}

const MAX_DIFF_BYTES: usize = 10 * 1024 * 1024;

/// Derives `feature/<first-12-chars-of-id>-<slug-of-description>` (spec §4.2).
pub fn derive_branch_name(feature: &Feature) -> String {
    let short_id: String = feature.id.chars().take(12).collect();
    let slug = slugify(&feature.description);
    format!("feature/{short_id}-{slug}")
}

fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase();
    let filtered: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == ' ' { c } else { ' ' })
        .collect();
    let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join("-");
    collapsed.chars().take(40).collect()
}

/// `<project>/.automaker/worktrees/<branchName-without-prefix>` (spec §4.2).
pub fn derive_worktree_path(project_dir: &Path, branch_name: &str) -> PathBuf {
    let stripped = branch_name.strip_prefix("feature/").unwrap_or(branch_name);
    project_dir.join(".automaker").join("worktrees").join(stripped)
}

pub struct WorktreeManager {
    cache: RwLock<HashMap<String, WorktreeRecord>>,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self { cache: RwLock::new(HashMap::new()) }
    }

    pub async fn is_vcs_repo(&self, project_dir: &Path) -> bool {
        let dir = project_dir.to_path_buf();
        task::spawn_blocking(move || is_git_repo(&dir)).await.unwrap_or(false)
    }

    pub async fn create(
        &self,
        project_dir: &Path,
        feature: &Feature,
    ) -> Result<WorktreeCreateResult, WorktreeError> {
        let branch_name = derive_branch_name(feature);
        let worktree_path = derive_worktree_path(project_dir, &branch_name);

        if let Some(existing) = self.find_existing(project_dir, &branch_name, &worktree_path).await? {
            self.cache.write().unwrap().insert(
                feature.id.clone(),
                WorktreeRecord {
                    feature_id: feature.id.clone(),
                    path: existing.path.clone(),
                    branch: existing.branch.clone(),
                    base_branch: existing.base_branch.clone(),
                },
            );
            return Ok(WorktreeCreateResult {
                worktree_path: existing.path,
                branch_name: existing.branch,
                base_branch: existing.base_branch,
                preexisting: true,
            });
        }

        let project = project_dir.to_path_buf();
        let wt = worktree_path.clone();
        let branch = branch_name.clone();
        let base_branch = task::spawn_blocking(move || create_worktree(&project, &wt, &branch)).await??;

        copy_project_files(project_dir, &worktree_path);

        self.cache.write().unwrap().insert(
            feature.id.clone(),
            WorktreeRecord {
                feature_id: feature.id.clone(),
                path: worktree_path.clone(),
                branch: branch_name.clone(),
                base_branch: base_branch.clone(),
            },
        );

        Ok(WorktreeCreateResult {
            worktree_path,
            branch_name,
            base_branch,
            preexisting: false,
        })
    }

    async fn find_existing(
        &self,
        project_dir: &Path,
        branch_name: &str,
        worktree_path: &Path,
    ) -> Result<Option<WorktreeRecord>, WorktreeError> {
        let project = project_dir.to_path_buf();
        let branch = branch_name.to_string();
        let path = worktree_path.to_path_buf();
        let entries = task::spawn_blocking(move || list_worktrees(&project)).await??;

        Ok(entries.into_iter().find_map(|e| {
            if e.path == path || e.branch == branch {
                Some(WorktreeRecord {
                    feature_id: String::new(),
                    path: e.path,
                    branch: e.branch,
                    base_branch: e.base_branch,
                })
            } else {
                None
            }
        }))
    }

    pub async fn get(
        &self,
        project_dir: &Path,
        feature_id: &str,
    ) -> Result<Option<WorktreeRecord>, WorktreeError> {
        if let Some(record) = self.cache.read().unwrap().get(feature_id).cloned() {
            return Ok(Some(record));
        }

        let short_id: String = feature_id.chars().take(12).collect();
        let project = project_dir.to_path_buf();
        let entries = task::spawn_blocking(move || list_worktrees(&project)).await??;

        let found = entries.into_iter().find(|e| e.branch.contains(&short_id));
        if let Some(ref e) = found {
            let record = WorktreeRecord {
                feature_id: feature_id.to_string(),
                path: e.path.clone(),
                branch: e.branch.clone(),
                base_branch: e.base_branch.clone(),
            };
            self.cache.write().unwrap().insert(feature_id.to_string(), record.clone());
            return Ok(Some(record));
        }
        Ok(None)
    }

    pub async fn remove(
        &self,
        project_dir: &Path,
        feature_id: &str,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        let record = self
            .get(project_dir, feature_id)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(feature_id.to_string()))?;

        let project = project_dir.to_path_buf();
        let path = record.path.clone();
        let branch = record.branch.clone();
        task::spawn_blocking(move || {
            remove_worktree(&project, &path)?;
            if delete_branch {
                delete_git_branch(&project, &branch)?;
            }
            Ok::<(), WorktreeError>(())
        })
        .await??;

        self.cache.write().unwrap().remove(feature_id);
        Ok(())
    }

    pub async fn list_all_feature_worktrees(
        &self,
        project_dir: &Path,
    ) -> Result<Vec<WorktreeRecord>, WorktreeError> {
        let project = project_dir.to_path_buf();
        let entries = task::spawn_blocking(move || list_worktrees(&project)).await??;
        Ok(entries
            .into_iter()
            .filter(|e| e.branch.starts_with("feature/"))
            .map(|e| WorktreeRecord {
                feature_id: String::new(),
                path: e.path,
                branch: e.branch,
                base_branch: e.base_branch,
            })
            .collect())
    }

    pub async fn status(&self, worktree_path: &Path) -> Result<WorktreeStatus, WorktreeError> {
        let path = worktree_path.to_path_buf();
        task::spawn_blocking(move || worktree_status(&path)).await?
    }

    pub async fn all_file_diffs(&self, worktree_path: &Path) -> Result<AllFileDiffs, WorktreeError> {
        let path = worktree_path.to_path_buf();
        task::spawn_blocking(move || all_file_diffs(&path)).await?
    }

    pub async fn file_diff(&self, worktree_path: &Path, file_path: &str) -> Result<String, WorktreeError> {
        let path = worktree_path.to_path_buf();
        let file = file_path.to_string();
        task::spawn_blocking(move || file_diff(&path, &file)).await?
    }

    pub async fn merge(
        &self,
        project_dir: &Path,
        feature_id: &str,
        options: MergeOptions,
    ) -> Result<(), WorktreeError> {
        let record = self
            .get(project_dir, feature_id)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(feature_id.to_string()))?;

        let project = project_dir.to_path_buf();
        let wt = record.path.clone();
        let branch = record.branch.clone();
        let id = feature_id.to_string();
        let cleanup = options.cleanup;
        task::spawn_blocking(move || merge_feature_branch(&project, &wt, &branch, &id, &options)).await??;

        if cleanup {
            self.remove(project_dir, feature_id, true).await?;
        }
        Ok(())
    }

    pub async fn sync(
        &self,
        project_dir: &Path,
        feature_id: &str,
        method: SyncMethod,
    ) -> Result<(), WorktreeError> {
        let record = self
            .get(project_dir, feature_id)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(feature_id.to_string()))?;

        let wt = record.path.clone();
        let base = record.base_branch.clone();
        task::spawn_blocking(move || sync_worktree(&wt, &base, method)).await??;
        Ok(())
    }

    pub async fn cleanup_orphaned(
        &self,
        project_dir: &Path,
        active_ids: &[String],
    ) -> Result<Vec<String>, WorktreeError> {
        let all = self.list_all_feature_worktrees(project_dir).await?;
        let active_short_ids: Vec<String> = active_ids.iter().map(|id| id.chars().take(12).collect()).collect();
        let managed_root = project_dir.join(".automaker").join("worktrees");

        let mut removed = Vec::new();
        for record in all {
            if !record.path.starts_with(&managed_root) {
                continue;
            }
            let matches_active = active_short_ids.iter().any(|sid| record.branch.contains(sid));
            if matches_active {
                continue;
            }

            let project = project_dir.to_path_buf();
            let path = record.path.clone();
            let branch = record.branch.clone();
            task::spawn_blocking(move || {
                remove_worktree(&project, &path)?;
                delete_git_branch(&project, &branch)
            })
            .await??;
            removed.push(record.branch);
        }
        Ok(removed)
    }
}

fn run(dir: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorktreeError::Git(format!("git {}: {e}", args.join(" "))))
}

fn ensure_success(output: &Output, context: &str) -> Result<(), WorktreeError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::Git(format!("{context}: {stderr}")));
    }
    Ok(())
}

pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn current_branch(dir: &Path) -> Result<String, WorktreeError> {
    let output = run(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    ensure_success(&output, "git rev-parse HEAD")?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

struct WorktreeListEntry {
    path: PathBuf,
    branch: String,
    base_branch: String,
}

/// Parses `git worktree list --porcelain` output.
fn list_worktrees(project_dir: &Path) -> Result<Vec<WorktreeListEntry>, WorktreeError> {
    let output = run(project_dir, &["worktree", "list", "--porcelain"])?;
    ensure_success(&output, "git worktree list")?;
    let base_branch = current_branch(project_dir).unwrap_or_default();

    let text = String::from_utf8_lossy(&output.stdout);
    let mut entries = Vec::new();
    let mut cur_path: Option<PathBuf> = None;
    let mut cur_branch: Option<String> = None;

    for line in text.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(path) = cur_path.take() {
                entries.push(WorktreeListEntry { path, branch: cur_branch.take().unwrap_or_default(), base_branch: base_branch.clone() });
            }
            cur_path = Some(PathBuf::from(p));
        } else if let Some(b) = line.strip_prefix("branch ") {
            cur_branch = Some(b.trim_start_matches("refs/heads/").to_string());
        } else if line.is_empty() {
            if let Some(path) = cur_path.take() {
                entries.push(WorktreeListEntry { path, branch: cur_branch.take().unwrap_or_default(), base_branch: base_branch.clone() });
            }
        }
    }
    if let Some(path) = cur_path.take() {
        entries.push(WorktreeListEntry { path, branch: cur_branch.take().unwrap_or_default(), base_branch });
    }
    Ok(entries)
}

fn create_worktree(project_dir: &Path, worktree_dir: &Path, branch: &str) -> Result<String, WorktreeError> {
    let base_branch = current_branch(project_dir)?;
    let branch_exists = run(project_dir, &["rev-parse", "--verify", branch]).map(|o| o.status.success()).unwrap_or(false);

    if let Some(parent) = worktree_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let worktree_str = worktree_dir.to_string_lossy().into_owned();
    let output = if branch_exists {
        run(project_dir, &["worktree", "add", &worktree_str, branch])?
    } else {
        run(project_dir, &["worktree", "add", "-b", branch, &worktree_str])?
    };
    ensure_success(&output, "git worktree add")?;
    Ok(base_branch)
}

fn copy_project_files(project_dir: &Path, worktree_path: &Path) {
    let src_root = project_dir.join(".automaker");
    let dest_root = worktree_path.join(".automaker");
    for name in ["app_spec.txt", "categories.json"] {
        let src = src_root.join(name);
        if src.exists() {
            let _ = std::fs::create_dir_all(&dest_root);
            let _ = std::fs::copy(&src, dest_root.join(name));
        }
    }
}

fn remove_worktree(project_dir: &Path, worktree_dir: &Path) -> Result<(), WorktreeError> {
    let worktree_str = worktree_dir.to_string_lossy().into_owned();
    let output = run(project_dir, &["worktree", "remove", "--force", &worktree_str])?;
    ensure_success(&output, "git worktree remove")?;
    Ok(())
}

fn delete_git_branch(project_dir: &Path, branch: &str) -> Result<(), WorktreeError> {
    let output = run(project_dir, &["branch", "-D", branch])?;
    if !output.status.success() {
        tracing::warn!(branch, "failed to delete branch after worktree removal");
    }
    Ok(())
}

fn status_char_to_text(c: char) -> &'static str {
    match c {
        'M' => "modified",
        'A' => "added",
        'D' => "deleted",
        'R' => "renamed",
        'C' => "copied",
        'U' => "unmerged",
        '?' => "untracked",
        '!' => "ignored",
        _ => "unknown",
    }
}

fn worktree_status(worktree_path: &Path) -> Result<WorktreeStatus, WorktreeError> {
    let output = run(worktree_path, &["status", "--porcelain"])?;
    ensure_success(&output, "git status")?;
    let text = String::from_utf8_lossy(&output.stdout);
    let files: Vec<String> = text.lines().take(20).map(|l| l.trim().to_string()).collect();
    let modified_count = text.lines().count();

    let diff_stat_output = run(worktree_path, &["diff", "--stat", "HEAD"])?;
    let diff_stat = String::from_utf8_lossy(&diff_stat_output.stdout).into_owned();

    let log_output = run(worktree_path, &["log", "-5", "--pretty=format:%h %s"])?;
    let recent_commits = String::from_utf8_lossy(&log_output.stdout).lines().map(|l| l.to_string()).collect();

    Ok(WorktreeStatus { modified_count, files, diff_stat, recent_commits })
}

fn all_file_diffs(worktree_path: &Path) -> Result<AllFileDiffs, WorktreeError> {
    let status_output = run(worktree_path, &["status", "--porcelain"])?;
    ensure_success(&status_output, "git status")?;
    let status_text = String::from_utf8_lossy(&status_output.stdout);

    let mut files = Vec::new();
    for line in status_text.lines() {
        if line.len() < 3 {
            continue;
        }
        let code = line.chars().next().unwrap_or('?');
        let path = line[3..].to_string();
        files.push(FileDiffEntry { path, status: code, status_text: status_char_to_text(code) });
    }

    let staged = run(worktree_path, &["diff", "--cached"])?;
    let unstaged = run(worktree_path, &["diff"])?;
    let mut diff = String::from_utf8_lossy(&staged.stdout).into_owned();
    diff.push_str(&String::from_utf8_lossy(&unstaged.stdout));
    if diff.len() > MAX_DIFF_BYTES {
        diff.truncate(MAX_DIFF_BYTES);
        diff.push_str("\n... [diff truncated]\n");
    }

    Ok(AllFileDiffs { has_changes: !files.is_empty(), diff, files })
}

fn file_diff(worktree_path: &Path, file_path: &str) -> Result<String, WorktreeError> {
    let unstaged = run(worktree_path, &["diff", "--", file_path])?;
    let unstaged_text = String::from_utf8_lossy(&unstaged.stdout).into_owned();
    if !unstaged_text.is_empty() {
        return Ok(unstaged_text);
    }

    let staged = run(worktree_path, &["diff", "--cached", "--", file_path])?;
    let staged_text = String::from_utf8_lossy(&staged.stdout).into_owned();
    if !staged_text.is_empty() {
        return Ok(staged_text);
    }

    let full_path = worktree_path.join(file_path);
    if full_path.exists() {
        let content = std::fs::read_to_string(&full_path).unwrap_or_default();
        let prefixed: String = content.lines().map(|l| format!("+{l}\n")).collect();
        return Ok(format!("--- /dev/null\n+++ b/{file_path}\n{prefixed}"));
    }

    Ok(String::new())
}

fn merge_feature_branch(
    project_dir: &Path,
    worktree_path: &Path,
    branch: &str,
    feature_id: &str,
    options: &MergeOptions,
) -> Result<(), WorktreeError> {
    let add = run(worktree_path, &["add", "-A"])?;
    ensure_success(&add, "git add")?;
    let diff_check = run(worktree_path, &["diff", "--cached", "--quiet"])?;
    if !diff_check.status.success() {
        let message = options.commit_message.clone().unwrap_or_else(|| format!("feat: complete {feature_id}"));
        let commit = run(worktree_path, &["commit", "-m", &message])?;
        ensure_success(&commit, "git commit")?;
    }

    let output = if options.squash {
        let squash_merge = run(project_dir, &["merge", "--squash", branch])?;
        ensure_success(&squash_merge, "git merge --squash")?;
        let message = options.squash_message.clone().unwrap_or_else(|| format!("feat: complete {feature_id}"));
        run(project_dir, &["commit", "-m", &message])?
    } else {
        run(project_dir, &["merge", "--no-ff", branch, "--no-edit"])?
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let _ = run(project_dir, &["merge", "--abort"]);
        return Err(WorktreeError::MergeConflict(stderr));
    }
    Ok(())
}

fn sync_worktree(worktree_path: &Path, base_branch: &str, method: SyncMethod) -> Result<(), WorktreeError> {
    let args: [&str; 2] = match method {
        SyncMethod::Rebase => ["rebase", base_branch],
        SyncMethod::Merge => ["merge", base_branch],
    };
    let output = run(worktree_path, &args)?;
    ensure_success(&output, "git sync")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{Feature, FeatureStatus};
    use chrono::Utc;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        for args in [vec!["init", "-q"], vec!["config", "user.email", "test@test.com"], vec!["config", "user.name", "Test"]] {
            StdCommand::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        StdCommand::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
    }

    fn sample_feature(id: &str, description: &str) -> Feature {
        Feature {
            id: id.into(),
            description: description.into(),
            category: "test".into(),
            priority: None,
            dependencies: vec![],
            status: FeatureStatus::Backlog,
            skip_tests: None,
            model: None,
            thinking_level: None,
            reasoning_effort: None,
            created_at: Utc::now(),
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
    fn branch_name_derivation_slugifies_and_truncates() {
        let feature = sample_feature("abcdefghijklmnop", "Add Dark Mode!! With Lots of Punctuation???");
        let branch = derive_branch_name(&feature);
        assert!(branch.starts_with("feature/abcdefghijkl-"));
        assert!(!branch.contains('!'));
        assert!(!branch.contains('?'));
    }

    #[test]
    fn worktree_path_strips_feature_prefix() {
        let path = derive_worktree_path(Path::new("/proj"), "feature/abc123-add-dark-mode");
        assert_eq!(path, PathBuf::from("/proj/.automaker/worktrees/abc123-add-dark-mode"));
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let feature = sample_feature("feat0001long", "add login page");
        let manager = WorktreeManager::new();

        let first = manager.create(dir.path(), &feature).await.unwrap();
        assert!(!first.preexisting);
        assert!(first.worktree_path.exists());

        let second = manager.create(dir.path(), &feature).await.unwrap();
        assert!(second.preexisting);
        assert_eq!(second.worktree_path, first.worktree_path);
        assert_eq!(second.branch_name, first.branch_name);

        let all = manager.list_all_feature_worktrees(dir.path()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn remove_then_revert_leaves_no_worktree_or_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let feature = sample_feature("feat0002long", "add logout");
        let manager = WorktreeManager::new();
        let created = manager.create(dir.path(), &feature).await.unwrap();

        manager.remove(dir.path(), &feature.id, true).await.unwrap();

        assert!(!created.worktree_path.exists());
        let branches = StdCommand::new("git")
            .args(["branch", "--list", &created.branch_name])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());
    }

    #[test]
    fn is_git_repo_detects_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
        init_repo(dir.path());
        assert!(is_git_repo(dir.path()));
    }
}
