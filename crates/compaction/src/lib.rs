//! # tidemark compaction
//!
//! Keeps a long conversation inside its context budget by compacting it in
//! the background:
//!
//! 1. **Observation** — once unobserved conversation tokens reach the
//!    observation threshold, an Observer model turns them into observations
//!    and the raw messages leave the window.
//! 2. **Reflection** — once the observation set reaches the reflection
//!    threshold, a Reflector model condenses it.
//!
//! Both stages pre-arm ("buffer") below their threshold and apply
//! backpressure above it. All state for one threshold configuration lives in
//! a single pipeline task behind a [`MemoryInstance`] handle.
//!
//! ```text
//!   request ─► dynamic_memory ─► StateBridge::sync ─► MemoryInstanceCache ─► MemoryInstance
//!                                      │                                        │
//!                                      └────────── BridgeReader ◄───────────────┤
//!                                                                               ▼
//!                                                    TokenAccountant · BufferController
//!                                                          Observer / Reflector workers
//! ```

pub mod accountant;
pub mod bridge;
pub mod buffer;
pub mod cache;
pub mod cycle;
pub mod factory;
pub mod instance;
pub mod progress;
pub mod worker;

#[cfg(test)]
mod test_helpers;

pub use accountant::{ConsistencyWarning, TokenAccountant, TokenAccountantState};
pub use bridge::{BridgeReader, ModelRole, RuntimeMirror, StateBridge};
pub use buffer::{BlockReason, BufferController, GateDecision};
pub use cache::MemoryInstanceCache;
pub use cycle::{CompactionCycle, CycleConfig, CycleId, CycleOutcome};
pub use factory::{CompactionEngine, RequestContext, dynamic_memory};
pub use instance::{InstanceDeps, MemoryContext, MemoryInstance, PipelineSnapshot, StageSnapshot};
pub use progress::{NoopReporter, ProgressReporter, TracingReporter};
pub use worker::{
    CompactionOutput, CompactionWorker, ConversationWindow, ObservationSet, ObservationStage,
    Observer, PendingMessage, ReflectionStage, Reflector, Stage, WorkerInput,
};
