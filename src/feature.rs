//! Feature Store (spec §4.1): durable per-feature records under
//! `<project>/.automaker/features/<id>/feature.json`, with image
//! relocation and per-feature write serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse feature record: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feature not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    Archived,
}

impl FeatureStatus {
    /// Terminal from the scheduler's viewpoint (spec §3).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FeatureStatus::WaitingApproval | FeatureStatus::Verified | FeatureStatus::Archived
        )
    }

    /// A dependency satisfies the gate once it reaches verified or archived (spec §4.5.2).
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, FeatureStatus::Verified | FeatureStatus::Archived)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// "unset sorts as 2" (spec §4.5.2).
    pub fn sort_key(priority: Option<Priority>) -> Priority {
        priority.unwrap_or(Priority::Medium)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    None,
    Low,
    Medium,
    High,
    Ultrathink,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Generated,
    Approved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSpec {
    pub status: PlanStatus,
    pub content: String,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

/// Accepts either a bare path string or `{path, ...meta}` on the wire,
/// without the engine needing to interpret the metadata (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImagePath {
    Bare(String),
    WithMeta {
        path: String,
        #[serde(flatten)]
        meta: serde_json::Map<String, serde_json::Value>,
    },
}

impl ImagePath {
    pub fn path(&self) -> &str {
        match self {
            ImagePath::Bare(p) => p,
            ImagePath::WithMeta { path, .. } => path,
        }
    }

    fn with_path(&self, new_path: String) -> ImagePath {
        match self {
            ImagePath::Bare(_) => ImagePath::Bare(new_path),
            ImagePath::WithMeta { meta, .. } => ImagePath::WithMeta {
                path: new_path,
                meta: meta.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: FeatureStatus,
    #[serde(default)]
    pub skip_tests: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub just_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub image_paths: Vec<ImagePath>,
    #[serde(default)]
    pub plan_spec: Option<PlanSpec>,
}

/// A draft supplied by a caller creating a feature; most fields default.
#[derive(Debug, Clone, Default)]
pub struct FeatureDraft {
    pub id: Option<String>,
    pub description: String,
    pub category: String,
    pub priority: Option<Priority>,
    pub dependencies: Vec<String>,
    pub skip_tests: Option<bool>,
    pub model: Option<String>,
    pub thinking_level: Option<ThinkingLevel>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub image_paths: Vec<ImagePath>,
}

/// A partial update. `error` uses `Option<Option<String>>` to resolve the
/// spec's own clearing ambiguity (§9 Open Questions): outer `None` means
/// "leave untouched", `Some(None)` means "clear", `Some(Some(s))` sets it.
#[derive(Debug, Clone, Default)]
pub struct FeatureUpdate {
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Option<Priority>>,
    pub dependencies: Option<Vec<String>>,
    pub status: Option<FeatureStatus>,
    pub skip_tests: Option<Option<bool>>,
    pub model: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub just_finished_at: Option<Option<DateTime<Utc>>>,
    pub summary: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub worktree_path: Option<Option<String>>,
    pub branch_name: Option<Option<String>>,
    pub image_paths: Option<Vec<ImagePath>>,
    pub plan_spec: Option<Option<PlanSpec>>,
}

fn apply_field<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *target = v.clone();
    }
}

fn apply_opt_field<T: Clone>(target: &mut Option<T>, value: &Option<Option<T>>) {
    if let Some(v) = value {
        *target = v.clone();
    }
}

/// Generates a time-ordered opaque feature id (spec §3 "Identity").
pub fn generate_id() -> String {
    let now = Utc::now();
    format!(
        "{:013}-{}",
        now.timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..8]
    )
}

pub struct FeatureStore {
    project_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FeatureStore {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn features_root(&self) -> PathBuf {
        self.project_dir.join(".automaker").join("features")
    }

    fn feature_dir(&self, id: &str) -> PathBuf {
        self.features_root().join(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.feature_dir(id).join("feature.json")
    }

    fn images_dir(&self, id: &str) -> PathBuf {
        self.feature_dir(id).join("images")
    }

    fn agent_output_path(&self, id: &str) -> PathBuf {
        self.feature_dir(id).join("agent-output.md")
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reads every `features/*/feature.json`, skipping malformed entries
    /// with a warning, sorted by embedded creation timestamp ascending.
    pub async fn list(&self) -> Result<Vec<Feature>, FeatureError> {
        let root = self.features_root();
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut features = Vec::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join("feature.json");
            if !path.exists() {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Feature>(&content) {
                    Ok(f) => features.push(f),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed feature.json");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read feature.json");
                }
            }
        }

        features.sort_by_key(|f| f.created_at);
        Ok(features)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Feature>, FeatureError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn write(&self, feature: &Feature) -> Result<(), FeatureError> {
        tokio::fs::create_dir_all(self.feature_dir(&feature.id)).await?;
        let content = serde_json::to_string_pretty(feature)?;
        let path = self.record_path(&feature.id);
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    pub async fn create(&self, draft: FeatureDraft) -> Result<Feature, FeatureError> {
        let id = draft.id.unwrap_or_else(generate_id);
        let lock = self.lock_for(&id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(self.feature_dir(&id)).await?;

        let mut feature = Feature {
            id: id.clone(),
            description: draft.description,
            category: draft.category,
            priority: draft.priority,
            dependencies: draft.dependencies,
            status: FeatureStatus::Backlog,
            skip_tests: draft.skip_tests,
            model: draft.model,
            thinking_level: draft.thinking_level,
            reasoning_effort: draft.reasoning_effort,
            created_at: Utc::now(),
            started_at: None,
            just_finished_at: None,
            summary: None,
            error: None,
            worktree_path: None,
            branch_name: None,
            image_paths: draft.image_paths,
            plan_spec: None,
        };

        self.relocate_images(&mut feature).await?;
        self.write(&feature).await?;
        Ok(feature)
    }

    pub async fn update(&self, id: &str, update: FeatureUpdate) -> Result<Feature, FeatureError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut feature = self
            .get(id)
            .await?
            .ok_or_else(|| FeatureError::NotFound(id.to_string()))?;

        apply_field(&mut feature.description, &update.description);
        apply_field(&mut feature.category, &update.category);
        apply_opt_field(&mut feature.priority, &update.priority);
        apply_field(&mut feature.dependencies, &update.dependencies);
        apply_field(&mut feature.status, &update.status);
        apply_opt_field(&mut feature.skip_tests, &update.skip_tests);
        apply_opt_field(&mut feature.model, &update.model);
        apply_opt_field(&mut feature.started_at, &update.started_at);
        apply_opt_field(&mut feature.just_finished_at, &update.just_finished_at);
        apply_opt_field(&mut feature.summary, &update.summary);
        apply_opt_field(&mut feature.error, &update.error);
        apply_opt_field(&mut feature.worktree_path, &update.worktree_path);
        apply_opt_field(&mut feature.branch_name, &update.branch_name);
        apply_field(&mut feature.image_paths, &update.image_paths);
        apply_opt_field(&mut feature.plan_spec, &update.plan_spec);

        self.relocate_images(&mut feature).await?;
        self.write(&feature).await?;
        Ok(feature)
    }

    pub async fn delete(&self, id: &str) -> Result<(), FeatureError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let dir = self.feature_dir(id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Convenience over `update`; clears the prior error unless supplied.
    pub async fn set_status(
        &self,
        id: &str,
        status: FeatureStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<Feature, FeatureError> {
        self.update(
            id,
            FeatureUpdate {
                status: Some(status),
                summary: summary.map(Some),
                error: Some(error),
                ..Default::default()
            },
        )
        .await
    }

    /// Appends one more image path to a feature and relocates it in the
    /// same pass as `update` (used by the Tool-Call Bridge's attach_file).
    pub async fn attach_image(&self, id: &str, path: &str) -> Result<Feature, FeatureError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut feature = self.get(id).await?.ok_or_else(|| FeatureError::NotFound(id.to_string()))?;
        feature.image_paths.push(ImagePath::Bare(path.to_string()));
        self.relocate_images(&mut feature).await?;
        self.write(&feature).await?;
        Ok(feature)
    }

    pub async fn get_agent_output(&self, id: &str) -> Result<Option<String>, FeatureError> {
        let path = self.agent_output_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(tokio::fs::read_to_string(&path).await?))
    }

    pub fn agent_output_path_for(&self, id: &str) -> PathBuf {
        self.agent_output_path(id)
    }

    /// Picks the first record whose status is not a terminal state (spec §4.1).
    pub fn select_next_feature(features: &[Feature]) -> Option<&Feature> {
        features.iter().find(|f| !f.status.is_terminal())
    }

    /// Relocates every referenced image into the feature's `images/`
    /// directory, appending `-N` before the extension on collision.
    /// Missing source files are tolerated with a warning (spec §4.1).
    async fn relocate_images(&self, feature: &mut Feature) -> Result<(), FeatureError> {
        let images_dir = self.images_dir(&feature.id);
        let mut relocated = Vec::with_capacity(feature.image_paths.len());

        for image in &feature.image_paths {
            let src = PathBuf::from(image.path());
            if src.starts_with(&images_dir) {
                relocated.push(image.clone());
                continue;
            }

            if !src.exists() {
                tracing::warn!(path = %src.display(), "image attachment missing, skipping relocation");
                relocated.push(image.clone());
                continue;
            }

            tokio::fs::create_dir_all(&images_dir).await?;
            let file_name = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let dest = unique_destination(&images_dir, &file_name);
            tokio::fs::rename(&src, &dest).await?;
            relocated.push(image.with_path(dest.to_string_lossy().into_owned()));
        }

        feature.image_paths = relocated;
        Ok(())
    }
}

/// Appends `-N` before the extension until the destination is free.
fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(description: &str) -> FeatureDraft {
        FeatureDraft {
            description: description.into(),
            category: "test".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());

        let created = store.create(draft("add dark mode")).await.unwrap();
        assert_eq!(created.status, FeatureStatus::Backlog);

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn list_sorts_by_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());

        let mut first = store.create(draft("first")).await.unwrap();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        store.write(&first).await.unwrap();

        let second = store.create(draft("second")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn list_skips_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        store.create(draft("good")).await.unwrap();

        let bad_dir = dir.path().join(".automaker/features/bad-id");
        tokio::fs::create_dir_all(&bad_dir).await.unwrap();
        tokio::fs::write(bad_dir.join("feature.json"), "{not json")
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "good");
    }

    #[tokio::test]
    async fn set_status_clears_error_when_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        let created = store.create(draft("flaky")).await.unwrap();

        store
            .update(
                &created.id,
                FeatureUpdate {
                    error: Some(Some("boom".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store
            .set_status(&created.id, FeatureStatus::Verified, Some("done".into()), None)
            .await
            .unwrap();

        assert_eq!(updated.status, FeatureStatus::Verified);
        assert_eq!(updated.summary.as_deref(), Some("done"));
        assert_eq!(updated.error, None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        let created = store.create(draft("throwaway")).await.unwrap();

        store.delete(&created.id).await.unwrap();
        assert!(store.get(&created.id).await.unwrap().is_none());
        // Deleting again must not error.
        store.delete(&created.id).await.unwrap();
    }

    #[tokio::test]
    async fn relocates_images_into_feature_directory() {
        let dir = tempfile::tempdir().unwrap();
        let image_src = dir.path().join("screenshot.png");
        tokio::fs::write(&image_src, b"fake png").await.unwrap();

        let store = FeatureStore::new(dir.path());
        let mut d = draft("with image");
        d.image_paths = vec![ImagePath::Bare(image_src.to_string_lossy().into_owned())];
        let created = store.create(d).await.unwrap();

        let relocated_path = PathBuf::from(created.image_paths[0].path());
        assert!(relocated_path.starts_with(
            dir.path()
                .join(".automaker/features")
                .join(&created.id)
                .join("images")
        ));
        assert!(relocated_path.exists());
        assert!(!image_src.exists());
    }

    #[test]
    fn select_next_feature_skips_terminal_states() {
        let mut f1 = sample_feature("a", FeatureStatus::Verified);
        let f2 = sample_feature("b", FeatureStatus::Backlog);
        f1.created_at = Utc::now() - chrono::Duration::seconds(5);
        let features = vec![f1, f2.clone()];

        let next = FeatureStore::select_next_feature(&features).unwrap();
        assert_eq!(next.id, f2.id);
    }

    fn sample_feature(id: &str, status: FeatureStatus) -> Feature {
        Feature {
            id: id.into(),
            description: "x".into(),
            category: "cat".into(),
            priority: None,
            dependencies: vec![],
            status,
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
}
