//! Token accountant — the two counters that drive compaction.
//!
//! `pending_tokens` counts conversation tokens not yet covered by an
//! observation; `observation_tokens` counts the size of the accumulated
//! observation set. Both only ever move through the operations below, and
//! neither ever goes below zero: a removal larger than the counter clamps to
//! zero and is reported back as a [`ConsistencyWarning`].
//!
//! Percentages and compression ratios are derived on read, never stored.

use serde::{Deserialize, Serialize};
use tidemark_core::harness::{ThresholdConfig, TokenCount};
use tidemark_core::progress::CycleKind;
use tracing::warn;

// ── State ─────────────────────────────────────────────────────────────────

/// Point-in-time view of both counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccountantState {
    pub pending_tokens: TokenCount,
    pub observation_tokens: TokenCount,
}

impl TokenAccountantState {
    /// `pending / observation_threshold` as a percentage.
    pub fn observation_percent(&self, config: &ThresholdConfig) -> f64 {
        percent_of(self.pending_tokens, config.observation_threshold)
    }

    /// `observation_tokens / reflection_threshold` as a percentage.
    pub fn reflection_percent(&self, config: &ThresholdConfig) -> f64 {
        percent_of(self.observation_tokens, config.reflection_threshold)
    }
}

/// A removal asked for more tokens than the counter held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyWarning {
    /// The counter that was clamped, named by the stage that feeds on it.
    pub kind: CycleKind,
    pub requested: TokenCount,
    pub available: TokenCount,
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} counter clamped to zero: asked to remove {} of {} tokens",
            self.kind, self.requested, self.available
        )
    }
}

// ── Accountant ────────────────────────────────────────────────────────────

/// Owns the counters. Only the pipeline that owns a memory instance mutates
/// them, so there is no interior locking here.
#[derive(Debug, Default)]
pub struct TokenAccountant {
    state: TokenAccountantState,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an observation set that already exists (loaded from storage).
    pub fn with_observation_tokens(observation_tokens: TokenCount) -> Self {
        Self {
            state: TokenAccountantState {
                pending_tokens: 0,
                observation_tokens,
            },
        }
    }

    /// Continue from counters another accountant left off at.
    pub fn restore(state: TokenAccountantState) -> Self {
        Self { state }
    }

    /// A new conversation message entered the window.
    pub fn record_message(&mut self, tokens: TokenCount) {
        self.state.pending_tokens = self.state.pending_tokens.saturating_add(tokens);
    }

    /// An observation cycle covered `removed_pending` conversation tokens and
    /// produced `produced_observation` tokens of observations.
    pub fn record_observation_result(
        &mut self,
        removed_pending: TokenCount,
        produced_observation: TokenCount,
    ) -> Option<ConsistencyWarning> {
        let warning = remove(
            &mut self.state.pending_tokens,
            removed_pending,
            CycleKind::Observation,
        );
        self.state.observation_tokens = self
            .state
            .observation_tokens
            .saturating_add(produced_observation);
        warning
    }

    /// A reflection cycle replaced `removed_observation` tokens of the
    /// observation set with `produced_reflection` tokens.
    pub fn record_reflection_result(
        &mut self,
        removed_observation: TokenCount,
        produced_reflection: TokenCount,
    ) -> Option<ConsistencyWarning> {
        let warning = remove(
            &mut self.state.observation_tokens,
            removed_observation,
            CycleKind::Reflection,
        );
        self.state.observation_tokens = self
            .state
            .observation_tokens
            .saturating_add(produced_reflection);
        warning
    }

    pub fn snapshot(&self) -> TokenAccountantState {
        self.state
    }

    /// Zero both counters.
    pub fn reset(&mut self) {
        self.state = TokenAccountantState::default();
    }
}

fn remove(counter: &mut TokenCount, amount: TokenCount, kind: CycleKind) -> Option<ConsistencyWarning> {
    if amount <= *counter {
        *counter -= amount;
        return None;
    }
    let warning = ConsistencyWarning {
        kind,
        requested: amount,
        available: *counter,
    };
    warn!(
        kind = %kind,
        requested = amount,
        available = *counter,
        "Token counter removal exceeds its value, clamping to zero"
    );
    *counter = 0;
    Some(warning)
}

// ── Derived metrics ───────────────────────────────────────────────────────

/// `count / threshold` as a percentage; a zero threshold reads as 0%.
pub fn percent_of(count: TokenCount, threshold: TokenCount) -> f64 {
    if threshold == 0 {
        return 0.0;
    }
    count as f64 / threshold as f64 * 100.0
}

/// `input / max(1, output)`.
pub fn compression_ratio(input_tokens: TokenCount, output_tokens: TokenCount) -> f64 {
    input_tokens as f64 / output_tokens.max(1) as f64
}
