//! Optional user-authored context file per feature
//! (`.automaker/context/<featureId>.md`), read-only to the engine: a
//! caller may drop notes, gotchas, or links next to a feature and the
//! Orchestrator folds them into the run prompt, but the engine never
//! writes into this directory itself.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to read context file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ContextReader {
    root: PathBuf,
}

impl ContextReader {
    pub fn new(project_dir: &Path) -> Self {
        Self { root: project_dir.join(".automaker/context") }
    }

    /// Returns the file's contents, or `None` if the feature has no
    /// user-authored context file.
    pub async fn read(&self, feature_id: &str) -> Result<Option<String>, ContextError> {
        let path = self.root.join(format!("{feature_id}.md"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_context_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ContextReader::new(dir.path());
        assert!(reader.read("feat-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_existing_context_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".automaker/context")).unwrap();
        std::fs::write(dir.path().join(".automaker/context/feat-1.md"), "watch out for the rate limiter").unwrap();

        let reader = ContextReader::new(dir.path());
        let content = reader.read("feat-1").await.unwrap().unwrap();
        assert!(content.contains("rate limiter"));
    }
}
