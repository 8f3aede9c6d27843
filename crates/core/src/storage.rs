//! Storage trait — where observation records live between sessions.
//!
//! The compaction engine treats storage as an opaque handle: it loads the
//! record set for its scope once when a memory instance is built, and saves
//! the whole set back after each applied cycle. Nothing else is queried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::StorageError;
use crate::harness::{ScopeId, TokenCount};

/// Whether a record came from the observer or the reflector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Observation,
    Reflection,
}

/// A single compacted summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Unique ID for this record
    pub id: String,

    pub kind: RecordKind,

    /// The summary text
    pub content: String,

    /// Token size of `content` as accounted by the pipeline
    pub tokens: TokenCount,

    /// The cycle that produced this record
    pub cycle_id: u64,

    pub created_at: DateTime<Utc>,
}

impl ObservationRecord {
    pub fn new(kind: RecordKind, content: impl Into<String>, tokens: TokenCount, cycle_id: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            tokens,
            cycle_id,
            created_at: Utc::now(),
        }
    }
}

/// The opaque persistence collaborator (`StorageHandle`).
///
/// Implementations: in-memory (for testing), JSON file, none (no-op).
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "file", "none").
    fn name(&self) -> &str;

    /// Load every record stored for a scope, oldest first.
    async fn load(&self, scope: &ScopeId) -> std::result::Result<Vec<ObservationRecord>, StorageError>;

    /// Replace the stored record set for a scope.
    async fn save(&self, scope: &ScopeId, records: &[ObservationRecord]) -> std::result::Result<(), StorageError>;

    /// Drop everything stored for a scope.
    async fn clear(&self, scope: &ScopeId) -> std::result::Result<(), StorageError>;
}
