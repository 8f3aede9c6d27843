//! No-op store — observations live only as long as the memory instance.

use async_trait::async_trait;
use tidemark_core::error::StorageError;
use tidemark_core::harness::ScopeId;
use tidemark_core::storage::{ObservationRecord, ObservationStore};

/// A store that persists nothing.
pub struct NoopStore;

#[async_trait]
impl ObservationStore for NoopStore {
    fn name(&self) -> &str { "none" }

    async fn load(&self, _scope: &ScopeId) -> Result<Vec<ObservationRecord>, StorageError> {
        Ok(Vec::new())
    }

    async fn save(&self, _scope: &ScopeId, _records: &[ObservationRecord]) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self, _scope: &ScopeId) -> Result<(), StorageError> {
        Ok(())
    }
}
