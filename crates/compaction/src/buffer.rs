//! Buffer controller — decides when a compaction cycle may begin.
//!
//! For each stage the controller compares the stage's counter with its
//! threshold and [`BufferPolicy`]:
//!
//! ```text
//!   counter < activation point         → Idle
//!   activation point ≤ counter < limit → Buffer (prepare, do not invoke)
//!   counter ≥ threshold                → Start (or promote the buffered cycle)
//! ```
//!
//! `block_after` bounds outstanding work in two ways:
//!
//! - while a cycle runs, a counter at or past `threshold × block_after` is
//!   reported as blocked; the running cycle is never doubled either way.
//! - once `ceil(block_after)` starts in a row have not reduced the counter,
//!   the next start waits until another full threshold of input has arrived
//!   since the last one.
//!
//! Nothing blocks forever: a successful cycle or a reset clears the history,
//! and growth alone reopens a capped stage.

use tidemark_core::harness::{BufferPolicy, TokenCount};
use tidemark_core::progress::{CycleKind, CycleStatus};

/// What the pipeline should do with a stage right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Below the activation point; any buffered cycle should be dropped.
    Idle,
    /// Between activation and threshold; a cycle should be buffering.
    Buffer,
    /// At or over threshold with nothing running; start now.
    Start,
    /// A cycle is running and the backlog is still within bounds.
    Wait,
    /// Backpressure: no new start is permitted.
    Blocked {
        backlog: TokenCount,
        limit: TokenCount,
        reason: BlockReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The counter reached `threshold × block_after`.
    Backlog,
    /// `ceil(block_after)` starts in a row have not reduced the counter and
    /// less than a threshold of input arrived since the last one.
    UnreducedStarts,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backlog => f.write_str("backlog reached the block limit"),
            Self::UnreducedStarts => f.write_str("too many cycles started without reducing the backlog"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Gate {
    unreduced_starts: u32,
    /// Counter value when the latest unreduced start was made.
    last_start: TokenCount,
}

/// Per-stage gate bookkeeping. Owned by one pipeline; not shared.
#[derive(Debug, Default)]
pub struct BufferController {
    observation: Gate,
    reflection: Gate,
}

impl BufferController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one stage.
    ///
    /// `active` is the status of the stage's current cycle, if any. A stage
    /// never gets [`GateDecision::Start`] while its cycle is running.
    pub fn evaluate(
        &self,
        kind: CycleKind,
        counter: TokenCount,
        threshold: TokenCount,
        policy: &BufferPolicy,
        active: Option<CycleStatus>,
    ) -> GateDecision {
        if threshold == 0 {
            return GateDecision::Idle;
        }
        let gate = self.gate(kind);

        if active == Some(CycleStatus::Running) {
            let block_point = policy.block_point(threshold);
            if counter >= block_point {
                return GateDecision::Blocked {
                    backlog: counter,
                    limit: block_point,
                    reason: BlockReason::Backlog,
                };
            }
            return GateDecision::Wait;
        }

        if counter < policy.activation_point(threshold) && counter < threshold {
            return GateDecision::Idle;
        }
        if counter < threshold {
            return GateDecision::Buffer;
        }

        let retry_point = gate.last_start.saturating_add(threshold);
        if gate.unreduced_starts >= policy.max_unreduced_starts() && counter < retry_point {
            return GateDecision::Blocked {
                backlog: counter,
                limit: retry_point,
                reason: BlockReason::UnreducedStarts,
            };
        }
        GateDecision::Start
    }

    /// A cycle of `kind` was invoked while its counter stood at `counter`.
    pub fn note_started(&mut self, kind: CycleKind, counter: TokenCount) {
        let gate = self.gate_mut(kind);
        gate.unreduced_starts = gate.unreduced_starts.saturating_add(1);
        gate.last_start = counter;
    }

    /// A cycle of `kind` succeeded and reduced its counter.
    pub fn note_reduced(&mut self, kind: CycleKind) {
        *self.gate_mut(kind) = Gate::default();
    }

    /// Number of starts since the last successful reduction.
    pub fn unreduced_starts(&self, kind: CycleKind) -> u32 {
        self.gate(kind).unreduced_starts
    }

    /// Forget all start history, e.g. after reconfiguration or a clear.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn gate(&self, kind: CycleKind) -> &Gate {
        match kind {
            CycleKind::Observation => &self.observation,
            CycleKind::Reflection => &self.reflection,
        }
    }

    fn gate_mut(&mut self, kind: CycleKind) -> &mut Gate {
        match kind {
            CycleKind::Observation => &mut self.observation,
            CycleKind::Reflection => &mut self.reflection,
        }
    }
}
