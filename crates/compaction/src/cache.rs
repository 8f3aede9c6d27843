//! Memory instance cache.
//!
//! Holds exactly one instance, keyed by its [`ThresholdConfig`]. A request
//! with an equal configuration gets the same `Arc` back; a different
//! configuration evicts the old instance and builds a new one. This assumes
//! one active configuration per process: two callers alternating between
//! configurations would rebuild on every call.
//!
//! When only the thresholds changed, the new instance takes over the old
//! one's window and observations. A different scope starts from storage.

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tidemark_core::event::DomainEvent;
use tidemark_core::harness::ThresholdConfig;
use tidemark_core::storage::ObservationStore;
use tracing::{info, warn};

use crate::instance::{InstanceDeps, MemoryInstance};

struct Slot {
    key: ThresholdConfig,
    instance: Arc<MemoryInstance>,
}

pub struct MemoryInstanceCache {
    slot: Mutex<Option<Slot>>,
    deps: InstanceDeps,
}

impl MemoryInstanceCache {
    pub fn new(deps: InstanceDeps) -> Self {
        Self {
            slot: Mutex::new(None),
            deps,
        }
    }

    /// The instance for `config`, building it on a miss.
    ///
    /// `storage` is only used when an instance is built.
    pub fn get(&self, config: &ThresholdConfig, storage: Arc<dyn ObservationStore>) -> Arc<MemoryInstance> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = slot.as_ref() {
            if cached.key == *config {
                return Arc::clone(&cached.instance);
            }
        }

        let evicted = slot.take();
        if let Some(evicted) = &evicted {
            info!(
                scope = %evicted.key.scope,
                observation_threshold = evicted.key.observation_threshold,
                reflection_threshold = evicted.key.reflection_threshold,
                "Evicting memory instance for previous configuration"
            );
            self.deps.reporter.notify(DomainEvent::InstanceEvicted {
                scope: evicted.key.scope.to_string(),
                timestamp: Utc::now(),
            });
        }

        if let Err(e) = config.validate() {
            warn!(error = %e, "Building memory instance with invalid thresholds");
        }
        info!(
            scope = %config.scope,
            observation_threshold = config.observation_threshold,
            reflection_threshold = config.reflection_threshold,
            store = storage.name(),
            "Building memory instance"
        );
        let deps = self.deps.clone();
        let instance = match evicted.filter(|e| e.key.scope == config.scope) {
            Some(previous) => MemoryInstance::spawn_after(&previous.instance, config.clone(), storage, deps),
            None => MemoryInstance::spawn(config.clone(), storage, deps),
        };
        let instance = Arc::new(instance);
        *slot = Some(Slot {
            key: config.clone(),
            instance: Arc::clone(&instance),
        });
        instance
    }

    /// The cached instance, if any.
    pub fn current(&self) -> Option<Arc<MemoryInstance>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| Arc::clone(&s.instance))
    }

    /// Drop the cached instance. Its pipeline keeps running until every
    /// handle and in-flight worker is gone.
    pub fn invalidate(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::StateBridge;
    use crate::progress::{NoopReporter, ProgressReporter};
    use crate::test_helpers::{GatedProvider, ScriptedProvider, StaticResolver, harness_state, wait_for};
    use tidemark_core::event::EventBus;
    use tidemark_core::harness::{CompactionSettings, ScopeId};
    use tidemark_core::message::Message;
    use tidemark_core::progress::CycleStatus;
    use tidemark_memory::{InMemoryStore, NoopStore};

    fn cache() -> (StateBridge, MemoryInstanceCache) {
        let provider = Arc::new(ScriptedProvider::texts(vec![]));
        cache_with(harness_state(1000, 2000), StaticResolver::new(provider), Arc::new(NoopReporter))
    }

    fn cache_with(
        state: tidemark_core::harness::HarnessState,
        resolver: StaticResolver,
        reporter: Arc<dyn ProgressReporter>,
    ) -> (StateBridge, MemoryInstanceCache) {
        let bridge = StateBridge::new(&state, CompactionSettings::default());
        let deps = InstanceDeps {
            bridge: bridge.reader(),
            resolver: Arc::new(resolver),
            reporter,
        };
        (bridge, MemoryInstanceCache::new(deps))
    }

    #[tokio::test]
    async fn equal_config_returns_same_instance() {
        let (_bridge, cache) = cache();
        let config = ThresholdConfig::new(1000, 2000, ScopeId::new("test"));
        let a = cache.get(&config, Arc::new(NoopStore));
        let b = cache.get(&config.clone(), Arc::new(NoopStore));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_config_evicts() {
        let (_bridge, cache) = cache();
        let a = cache.get(&ThresholdConfig::new(1000, 2000, ScopeId::new("test")), Arc::new(NoopStore));
        let b = cache.get(&ThresholdConfig::new(1500, 2000, ScopeId::new("test")), Arc::new(NoopStore));
        assert!(!Arc::ptr_eq(&a, &b));
        let current = cache.current().unwrap();
        assert!(Arc::ptr_eq(&current, &b));
        assert_eq!(current.config().observation_threshold, 1500);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let (_bridge, cache) = cache();
        let config = ThresholdConfig::new(1000, 2000, ScopeId::new("test"));
        let a = cache.get(&config, Arc::new(NoopStore));
        cache.invalidate();
        assert!(cache.current().is_none());
        let b = cache.get(&config, Arc::new(NoopStore));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn scope_change_evicts_and_starts_empty() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let provider = Arc::new(ScriptedProvider::texts(vec![]));
        let (_bridge, cache) = cache_with(harness_state(1000, 2000), StaticResolver::new(provider), bus);

        let a = cache.get(&ThresholdConfig::new(1000, 2000, ScopeId::new("alpha")), Arc::new(NoopStore));
        a.ingest_counted(Message::user("for alpha"), 300);
        a.settle().await.unwrap();

        let b = cache.get(&ThresholdConfig::new(1000, 2000, ScopeId::new("beta")), Arc::new(NoopStore));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().scope.as_str(), "beta");

        let snap = wait_for(&b, |s| s.loaded).await;
        assert_eq!(snap.tokens.pending_tokens, 0);
        assert_eq!(snap.unobserved_messages, 0);
        // The old scope keeps its own window
        assert_eq!(a.snapshot().tokens.pending_tokens, 300);

        match events.try_recv().unwrap().as_ref() {
            DomainEvent::InstanceEvicted { scope, .. } => assert_eq!(scope, "alpha"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn threshold_change_carries_the_window_and_running_cycle() {
        let provider = Arc::new(GatedProvider::new("- observed", 100));
        let store = InMemoryStore::new();
        let mut state = harness_state(1000, 5000);
        let (bridge, cache) = cache_with(
            state.clone(),
            StaticResolver::new(provider.clone()),
            Arc::new(NoopReporter),
        );

        let old = cache.get(&bridge.snapshot().thresholds, Arc::new(store.clone()));
        old.ingest_counted(Message::user("first"), 1000);
        old.ingest_counted(Message::user("second"), 500);
        old.settle().await.unwrap();
        assert_eq!(old.snapshot().observation.status, CycleStatus::Running);
        assert_eq!(provider.calls(), 1);

        state.observation_threshold = 1500;
        bridge.sync(&state);
        let new = cache.get(&bridge.snapshot().thresholds, Arc::new(store.clone()));
        assert!(!Arc::ptr_eq(&old, &new));

        let snap = wait_for(&new, |s| s.loaded).await;
        assert_eq!(snap.tokens.pending_tokens, 1500);
        assert_eq!(snap.unobserved_messages, 2);
        assert_eq!(snap.observation.status, CycleStatus::Running);
        assert_eq!(snap.observation.cycle_id, Some(1));

        // The result of the cycle the old instance started lands here
        provider.release();
        let snap = wait_for(&new, |s| s.observation.completed_cycles == 1).await;
        assert_eq!(snap.tokens.pending_tokens, 500);
        assert_eq!(snap.records, 1);

        // Input sent through the old handle reaches the new pipeline
        old.ingest_counted(Message::user("third"), 1000);
        let snap = wait_for(&new, |s| s.observation.status == CycleStatus::Running).await;
        assert_eq!(snap.observation.cycle_id, Some(2));
        provider.release();
        let snap = wait_for(&new, |s| s.observation.completed_cycles == 2).await;
        assert_eq!(snap.records, 2);
        assert_eq!(snap.tokens.pending_tokens, 0);

        let scope = new.config().scope.clone();
        assert_eq!(store.load(&scope).await.unwrap().len(), 2);
    }
}
