//! Engine wiring and the per-request memory factory.
//!
//! The harness asks for memory once per request. [`CompactionEngine`] reads
//! the request's harness state, pushes it through the [`StateBridge`], and
//! hands back the cached [`MemoryInstance`] for the resulting thresholds.

use chrono::Utc;
use std::sync::Arc;
use tidemark_core::event::DomainEvent;
use tidemark_core::harness::{CompactionSettings, HarnessState, HarnessStateSource};
use tidemark_core::provider::ModelResolver;
use tidemark_core::storage::ObservationStore;

use crate::bridge::{BridgeReader, StateBridge};
use crate::cache::MemoryInstanceCache;
use crate::instance::{InstanceDeps, MemoryInstance};
use crate::progress::ProgressReporter;

/// What a request carries into the factory.
#[derive(Clone)]
pub struct RequestContext {
    pub harness: Arc<dyn HarnessStateSource>,
}

impl RequestContext {
    pub fn new(harness: Arc<dyn HarnessStateSource>) -> Self {
        Self { harness }
    }
}

pub struct CompactionEngine {
    bridge: StateBridge,
    mirror: BridgeReader,
    cache: MemoryInstanceCache,
    reporter: Arc<dyn ProgressReporter>,
}

impl CompactionEngine {
    pub fn new(
        initial: &HarnessState,
        settings: CompactionSettings,
        resolver: Arc<dyn ModelResolver>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let bridge = StateBridge::new(initial, settings);
        let deps = InstanceDeps {
            bridge: bridge.reader(),
            resolver,
            reporter: Arc::clone(&reporter),
        };
        Self {
            mirror: bridge.reader(),
            bridge,
            cache: MemoryInstanceCache::new(deps),
            reporter,
        }
    }

    /// Sync the request's harness state, then return the instance for it.
    pub fn memory_for(&self, ctx: &RequestContext, storage: Arc<dyn ObservationStore>) -> Arc<MemoryInstance> {
        let state = ctx.harness.get_state();
        if let Some(generation) = self.bridge.sync(&state) {
            let mirror = self.bridge.snapshot();
            self.reporter.notify(DomainEvent::HarnessReconfigured {
                generation,
                observer_model: mirror.observer_model,
                reflector_model: mirror.reflector_model,
                timestamp: Utc::now(),
            });
        }
        // The mirror holds the thresholds and scope the sync just wrote
        self.cache.get(&self.mirror.current_thresholds(), storage)
    }

    /// Replace buffering policies and limits for subsequent cycles.
    pub fn update_settings(&self, settings: CompactionSettings) -> u64 {
        self.bridge.update_settings(settings)
    }

    pub fn bridge(&self) -> BridgeReader {
        self.bridge.reader()
    }

    pub fn cache(&self) -> &MemoryInstanceCache {
        &self.cache
    }
}

/// A per-request memory factory closed over `engine` and `storage`.
pub fn dynamic_memory(
    engine: Arc<CompactionEngine>,
    storage: Arc<dyn ObservationStore>,
) -> impl Fn(&RequestContext) -> Arc<MemoryInstance> + Send + Sync + 'static {
    move |ctx| engine.memory_for(ctx, Arc::clone(&storage))
}
