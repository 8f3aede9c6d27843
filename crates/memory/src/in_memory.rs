//! In-memory store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tidemark_core::error::StorageError;
use tidemark_core::harness::ScopeId;
use tidemark_core::storage::{ObservationRecord, ObservationStore};
use tokio::sync::RwLock;

/// Keeps each scope's record set in a map.
/// Useful for testing and sessions where persistence isn't needed.
#[derive(Clone)]
pub struct InMemoryStore {
    scopes: Arc<RwLock<HashMap<ScopeId, Vec<ObservationRecord>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            scopes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seed a scope before handing the store to the engine.
    pub async fn with_records(self, scope: ScopeId, records: Vec<ObservationRecord>) -> Self {
        self.scopes.write().await.insert(scope, records);
        self
    }

    /// Number of scopes with stored records.
    pub async fn scope_count(&self) -> usize {
        self.scopes.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObservationStore for InMemoryStore {
    fn name(&self) -> &str { "in_memory" }

    async fn load(&self, scope: &ScopeId) -> Result<Vec<ObservationRecord>, StorageError> {
        Ok(self.scopes.read().await.get(scope).cloned().unwrap_or_default())
    }

    async fn save(&self, scope: &ScopeId, records: &[ObservationRecord]) -> Result<(), StorageError> {
        self.scopes.write().await.insert(scope.clone(), records.to_vec());
        Ok(())
    }

    async fn clear(&self, scope: &ScopeId) -> Result<(), StorageError> {
        self.scopes.write().await.remove(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::storage::RecordKind;

    fn record(content: &str) -> ObservationRecord {
        ObservationRecord::new(RecordKind::Observation, content, 10, 1)
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = InMemoryStore::new();
        let scope = ScopeId::new("project-a");
        store.save(&scope, &[record("first"), record("second")]).await.unwrap();

        let loaded = store.load(&scope).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "first");
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = InMemoryStore::new();
        store.save(&ScopeId::new("a"), &[record("only in a")]).await.unwrap();
        assert!(store.load(&ScopeId::new("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_set() {
        let store = InMemoryStore::new();
        let scope = ScopeId::new("a");
        store.save(&scope, &[record("old 1"), record("old 2")]).await.unwrap();
        store.save(&scope, &[record("new")]).await.unwrap();
        let loaded = store.load(&scope).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "new");
    }

    #[tokio::test]
    async fn clear_removes_scope() {
        let store = InMemoryStore::new()
            .with_records(ScopeId::new("a"), vec![record("x")])
            .await;
        assert_eq!(store.scope_count().await, 1);
        store.clear(&ScopeId::new("a")).await.unwrap();
        assert_eq!(store.scope_count().await, 0);
    }
}
