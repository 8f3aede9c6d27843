//! File-based store — persistent JSON-lines storage.
//!
//! Each scope gets its own file `<dir>/<scope>.jsonl`; each line is a
//! JSON-encoded `ObservationRecord`. Saves rewrite the whole file through a
//! temporary sibling and a rename, so a crash mid-write leaves the previous
//! set intact.
//!
//! Default location: `~/.tidemark/observations/`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tidemark_core::error::StorageError;
use tidemark_core::harness::ScopeId;
use tidemark_core::storage::{ObservationRecord, ObservationStore};
use tracing::{debug, warn};

/// A directory of JSONL files, one per scope.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Default directory: `~/.tidemark/observations`
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".tidemark").join("observations")
    }

    /// File path for a scope. Anything outside `[A-Za-z0-9._-]` becomes `_`.
    pub fn scope_path(&self, scope: &ScopeId) -> PathBuf {
        let name: String = scope
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        let name = if name.is_empty() { "default".to_string() } else { name };
        self.dir.join(format!("{name}.jsonl"))
    }

    fn parse(path: &Path, content: &str) -> Vec<ObservationRecord> {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<ObservationRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupted observation record");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl ObservationStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, scope: &ScopeId) -> Result<Vec<ObservationRecord>, StorageError> {
        let path = self.scope_path(scope);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            // Nothing saved for this scope yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        let records = Self::parse(&path, &content);
        debug!(path = %path.display(), count = records.len(), "Loaded observation records");
        Ok(records)
    }

    async fn save(&self, scope: &ScopeId, records: &[ObservationRecord]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create observation directory: {e}"))
        })?;

        let mut content = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| StorageError::Corrupted {
                scope: scope.to_string(),
                reason: e.to_string(),
            })?;
            content.push_str(&line);
            content.push('\n');
        }

        let path = self.scope_path(scope);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to replace {}: {e}", path.display())))?;
        Ok(())
    }

    async fn clear(&self, scope: &ScopeId) -> Result<(), StorageError> {
        let path = self.scope_path(scope);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
