//! Progress events — the state-change stream a UI consumes.
//!
//! Every status transition of an observation or reflection cycle produces a
//! [`ProgressEvent`]. The figures in it are recomputed from the live counters
//! at emission time; nothing here is cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::harness::TokenCount;

/// Which pipeline a cycle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Observation,
    Reflection,
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Observation => f.write_str("observation"),
            Self::Reflection => f.write_str("reflection"),
        }
    }
}

/// Lifecycle of a compaction cycle.
///
/// `Idle → Buffering → Running → Complete | Failed`. A cycle may also jump
/// straight from `Idle` to `Running` when the hard threshold is crossed in one
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    #[default]
    Idle,
    Buffering,
    Running,
    Complete,
    Failed,
}

impl CycleStatus {
    /// `Buffering` or `Running`: a cycle of this kind exists and blocks another.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Buffering | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One state-change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: CycleKind,
    pub status: CycleStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<u64>,

    pub pending_tokens: TokenCount,
    pub threshold: TokenCount,
    pub threshold_percent: f64,

    pub observation_tokens: TokenCount,
    pub reflection_threshold: TokenCount,
    pub reflection_threshold_percent: f64,

    /// Input/output ratio of a completed cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Backlog or consistency warning attached to this transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,

    pub timestamp: DateTime<Utc>,
}
