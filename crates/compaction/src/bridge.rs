//! State bridge — makes harness configuration visible to background work.
//!
//! Models and thresholds are chosen on the request path, but cycles run on
//! background tasks that never see a request. The bridge is the one place the
//! request path writes that configuration and the background reads it.
//!
//! [`StateBridge`] is the single writer and is deliberately not `Clone`.
//! [`BridgeReader`]s are cheap to clone and always read one complete
//! [`RuntimeMirror`]: model ids, thresholds and limits are swapped together,
//! so a reader never pairs a new model with an old threshold.

use serde::Serialize;
use std::time::Duration;
use tidemark_core::harness::{
    BufferPolicy, CompactionSettings, HarnessState, ThresholdConfig, TokenCount,
};
use tidemark_core::progress::CycleKind;
use tokio::sync::watch;
use tracing::info;

use crate::cycle::CycleConfig;

/// Which model a caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Observer,
    Reflector,
}

impl From<CycleKind> for ModelRole {
    fn from(kind: CycleKind) -> Self {
        match kind {
            CycleKind::Observation => Self::Observer,
            CycleKind::Reflection => Self::Reflector,
        }
    }
}

/// The configuration background work reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeMirror {
    /// Bumped on every change. Starts at 1.
    pub generation: u64,
    pub observer_model: String,
    pub reflector_model: String,
    pub thresholds: ThresholdConfig,
    pub settings: CompactionSettings,
}

impl RuntimeMirror {
    fn from_state(state: &HarnessState, settings: CompactionSettings, generation: u64) -> Self {
        Self {
            generation,
            observer_model: state.observer_model_id.clone(),
            reflector_model: state.reflector_model_id.clone(),
            thresholds: ThresholdConfig::from_state(state, &settings.default_scope),
            settings,
        }
    }

    pub fn model(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Observer => &self.observer_model,
            ModelRole::Reflector => &self.reflector_model,
        }
    }

    pub fn policy(&self, kind: CycleKind) -> BufferPolicy {
        match kind {
            CycleKind::Observation => self.settings.observation,
            CycleKind::Reflection => self.settings.reflection,
        }
    }

    /// Freeze what a `kind` cycle needs at start. `output_limit` is the
    /// reflection threshold of the instance running the cycle.
    pub fn cycle_config(&self, kind: CycleKind, output_limit: TokenCount) -> CycleConfig {
        let max_output_tokens = match kind {
            CycleKind::Observation => self.settings.observer_max_output_tokens,
            CycleKind::Reflection => self.settings.reflector_max_output_tokens,
        };
        CycleConfig {
            model_id: self.model(kind.into()).to_string(),
            max_output_tokens,
            timeout: Duration::from_secs(self.settings.invocation_timeout_secs),
            output_limit,
            generation: self.generation,
        }
    }
}

/// The writer half.
pub struct StateBridge {
    tx: watch::Sender<RuntimeMirror>,
}

impl StateBridge {
    pub fn new(initial: &HarnessState, settings: CompactionSettings) -> Self {
        let (tx, _) = watch::channel(RuntimeMirror::from_state(initial, settings, 1));
        Self { tx }
    }

    /// Copy the harness state into the mirror.
    ///
    /// Returns the new generation when anything changed, `None` when the
    /// state matched what was already mirrored.
    pub fn sync(&self, state: &HarnessState) -> Option<u64> {
        let mut generation = None;
        self.tx.send_if_modified(|mirror| {
            let next = RuntimeMirror::from_state(state, mirror.settings.clone(), mirror.generation + 1);
            let unchanged = next.observer_model == mirror.observer_model
                && next.reflector_model == mirror.reflector_model
                && next.thresholds == mirror.thresholds;
            if unchanged {
                return false;
            }
            generation = Some(next.generation);
            *mirror = next;
            true
        });

        if let Some(generation) = generation {
            let mirror = self.tx.borrow();
            info!(
                generation,
                observer = %mirror.observer_model,
                reflector = %mirror.reflector_model,
                observation_threshold = mirror.thresholds.observation_threshold,
                reflection_threshold = mirror.thresholds.reflection_threshold,
                "Harness configuration changed"
            );
        }
        generation
    }

    /// Replace buffering policies and limits. Always bumps the generation.
    pub fn update_settings(&self, settings: CompactionSettings) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|mirror| {
            // A scope that came from the old default follows the new one
            if mirror.thresholds.scope == mirror.settings.default_scope {
                mirror.thresholds.scope = settings.default_scope.clone();
            }
            mirror.settings = settings;
            mirror.generation += 1;
            generation = mirror.generation;
        });
        generation
    }

    pub fn reader(&self) -> BridgeReader {
        BridgeReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> RuntimeMirror {
        self.tx.borrow().clone()
    }
}

/// The reader half, handed to pipelines and workers.
#[derive(Clone)]
pub struct BridgeReader {
    rx: watch::Receiver<RuntimeMirror>,
}

impl BridgeReader {
    /// One consistent copy of everything mirrored.
    pub fn snapshot(&self) -> RuntimeMirror {
        self.rx.borrow().clone()
    }

    pub fn current_model(&self, role: ModelRole) -> String {
        self.rx.borrow().model(role).to_string()
    }

    pub fn current_thresholds(&self) -> ThresholdConfig {
        self.rx.borrow().thresholds.clone()
    }

    pub fn generation(&self) -> u64 {
        self.rx.borrow().generation
    }
}
