//! Compaction cycles and their lifecycle.
//!
//! ```text
//!   idle ──► buffering ──► running ──► complete
//!     │                       │
//!     └──────────────────────►└──────► failed
//! ```
//!
//! A cycle captures its model and limits when it starts running; a
//! reconfiguration afterwards only affects the next cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tidemark_core::harness::TokenCount;
use tidemark_core::progress::{CycleKind, CycleStatus};
use tracing::warn;

use crate::accountant::compression_ratio;

pub type CycleId = u64;

/// Configuration frozen into a cycle at the moment it starts running.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleConfig {
    pub model_id: String,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    /// Output at or above this size is rejected.
    pub output_limit: TokenCount,
    /// Bridge generation the configuration was read from.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct CompactionCycle {
    pub cycle_id: CycleId,
    pub kind: CycleKind,
    pub status: CycleStatus,
    /// Pipeline epoch the cycle belongs to; a clear bumps the epoch.
    pub epoch: u64,
    pub input_tokens: TokenCount,
    pub output_tokens: Option<TokenCount>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: Option<CycleConfig>,
}

impl CompactionCycle {
    pub fn new(cycle_id: CycleId, kind: CycleKind, epoch: u64) -> Self {
        Self {
            cycle_id,
            kind,
            status: CycleStatus::Idle,
            epoch,
            input_tokens: 0,
            output_tokens: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            config: None,
        }
    }

    pub fn begin_buffering(&mut self) -> bool {
        self.transition(CycleStatus::Buffering)
    }

    /// Move to `running`, freezing `config` into the cycle.
    pub fn start(&mut self, config: CycleConfig, input_tokens: TokenCount) -> bool {
        if !self.transition(CycleStatus::Running) {
            return false;
        }
        self.config = Some(config);
        self.input_tokens = input_tokens;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn complete(&mut self, output_tokens: TokenCount) -> bool {
        if !self.transition(CycleStatus::Complete) {
            return false;
        }
        self.output_tokens = Some(output_tokens);
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self) -> bool {
        if !self.transition(CycleStatus::Failed) {
            return false;
        }
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_running(&self) -> bool {
        self.status == CycleStatus::Running
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }

    /// Only meaningful once the cycle completed.
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.status != CycleStatus::Complete {
            return None;
        }
        self.output_tokens
            .map(|output| compression_ratio(self.input_tokens, output))
    }

    /// Summary kept after the cycle itself is dropped.
    pub fn outcome(&self, error: Option<String>) -> CycleOutcome {
        CycleOutcome {
            cycle_id: self.cycle_id,
            kind: self.kind,
            status: self.status,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            compression_ratio: self.compression_ratio(),
            duration_ms: self.duration_ms(),
            model: self.config.as_ref().map(|c| c.model_id.clone()),
            error,
            finished_at: self.finished_at,
        }
    }

    fn transition(&mut self, to: CycleStatus) -> bool {
        use CycleStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Idle, Buffering) | (Idle, Running) | (Buffering, Running) | (Running, Complete) | (Running, Failed)
        );
        if allowed {
            self.status = to;
        } else {
            warn!(
                cycle_id = self.cycle_id,
                kind = %self.kind,
                from = ?self.status,
                to = ?to,
                "Ignoring invalid cycle transition"
            );
        }
        allowed
    }
}

/// What is remembered about the last finished cycle of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: CycleId,
    pub kind: CycleKind,
    pub status: CycleStatus,
    pub input_tokens: TokenCount,
    pub output_tokens: Option<TokenCount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CycleConfig {
        CycleConfig {
            model_id: "mock/observer".into(),
            max_output_tokens: 500,
            timeout: Duration::from_secs(5),
            output_limit: 2000,
            generation: 1,
        }
    }

    #[test]
    fn happy_path() {
        let mut cycle = CompactionCycle::new(1, CycleKind::Observation, 0);
        assert!(cycle.begin_buffering());
        assert!(cycle.start(config(), 1050));
        assert!(cycle.is_running());
        assert!(cycle.complete(200));
        assert_eq!(cycle.status, CycleStatus::Complete);
        let ratio = cycle.compression_ratio().unwrap();
        assert!((ratio - 5.25).abs() < f64::EPSILON);
        assert!(cycle.duration_ms().is_some());
    }

    #[test]
    fn idle_can_start_directly() {
        let mut cycle = CompactionCycle::new(2, CycleKind::Reflection, 0);
        assert!(cycle.start(config(), 2100));
        assert_eq!(cycle.config.as_ref().unwrap().model_id, "mock/observer");
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let mut cycle = CompactionCycle::new(3, CycleKind::Observation, 0);
        assert!(!cycle.complete(10));
        assert_eq!(cycle.status, CycleStatus::Idle);

        assert!(cycle.start(config(), 100));
        assert!(cycle.fail());
        assert!(!cycle.start(config(), 100));
        assert_eq!(cycle.status, CycleStatus::Failed);
    }

    #[test]
    fn failed_cycle_has_no_ratio() {
        let mut cycle = CompactionCycle::new(4, CycleKind::Observation, 0);
        cycle.start(config(), 100);
        cycle.fail();
        let outcome = cycle.outcome(Some("boom".into()));
        assert_eq!(outcome.status, CycleStatus::Failed);
        assert!(outcome.compression_ratio.is_none());
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        assert_eq!(outcome.model.as_deref(), Some("mock/observer"));
    }
}
