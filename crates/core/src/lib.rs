//! # tidemark core
//!
//! Domain types, traits, and error definitions for the tidemark context
//! compaction engine. This crate has **no runtime machinery**. It defines the
//! vocabulary that the storage, provider and compaction crates implement
//! against.
//!
//! ## Design Philosophy
//!
//! Every collaborator the compaction engine consumes is a trait here:
//! - [`Provider`] / [`ModelResolver`] — the summarization agent and how to reach it
//! - [`ObservationStore`] — the opaque storage handle
//! - [`HarnessStateSource`] — where user-facing configuration comes from
//!
//! Implementations live in their respective crates, so tests can swap in
//! scripted fakes.

pub mod error;
pub mod event;
pub mod harness;
pub mod message;
pub mod progress;
pub mod provider;
pub mod storage;
pub mod tokens;

// Re-export key types at crate root for ergonomics
pub use error::{CompactionError, Error, ProviderError, Result, StorageError};
pub use event::{DomainEvent, EventBus};
pub use harness::{
    BufferPolicy, CompactionSettings, HarnessState, HarnessStateSource, ScopeId, ThresholdConfig,
    TokenCount,
};
pub use message::{Message, Role};
pub use progress::{CycleKind, CycleStatus, ProgressEvent};
pub use provider::{ModelResolver, Provider, ProviderRequest, ProviderResponse, Usage};
pub use storage::{ObservationRecord, ObservationStore, RecordKind};
