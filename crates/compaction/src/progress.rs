//! Progress reporting.
//!
//! Every cycle transition produces a [`ProgressEvent`]. Where it goes is up
//! to the [`ProgressReporter`] the engine was built with: the event bus for
//! UIs, the log, or nowhere.

use chrono::Utc;
use tidemark_core::event::{DomainEvent, EventBus};
use tidemark_core::harness::ThresholdConfig;
use tidemark_core::progress::{CycleKind, CycleStatus, ProgressEvent};
use tracing::{debug, info, warn};

use crate::accountant::TokenAccountantState;
use crate::cycle::CompactionCycle;

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);

    /// Engine events that are not cycle progress. Ignored by default.
    fn notify(&self, _event: DomainEvent) {}
}

impl ProgressReporter for EventBus {
    fn report(&self, event: &ProgressEvent) {
        self.publish(DomainEvent::CompactionProgress(event.clone()));
    }

    fn notify(&self, event: DomainEvent) {
        self.publish(event);
    }
}

/// Writes progress to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) {
        if let Some(error) = &event.error {
            warn!(
                kind = %event.kind,
                cycle_id = ?event.cycle_id,
                error = %error,
                "Compaction cycle failed"
            );
            return;
        }
        match event.status {
            CycleStatus::Complete => info!(
                kind = %event.kind,
                cycle_id = ?event.cycle_id,
                ratio = ?event.compression_ratio,
                duration_ms = ?event.duration_ms,
                observation_tokens = event.observation_tokens,
                "Compaction cycle complete"
            ),
            _ => debug!(
                kind = %event.kind,
                status = ?event.status,
                pending_tokens = event.pending_tokens,
                threshold_percent = event.threshold_percent,
                reflection_percent = event.reflection_threshold_percent,
                "Compaction progress"
            ),
        }
    }

    fn notify(&self, event: DomainEvent) {
        debug!(event = ?event, "Compaction engine event");
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Build an event from the current counters. Ratio and duration come from
/// `cycle` when it has finished.
pub(crate) fn progress_event(
    kind: CycleKind,
    status: CycleStatus,
    cycle: Option<&CompactionCycle>,
    tokens: TokenAccountantState,
    config: &ThresholdConfig,
) -> ProgressEvent {
    ProgressEvent {
        kind,
        status,
        cycle_id: cycle.map(|c| c.cycle_id),
        pending_tokens: tokens.pending_tokens,
        threshold: config.observation_threshold,
        threshold_percent: tokens.observation_percent(config),
        observation_tokens: tokens.observation_tokens,
        reflection_threshold: config.reflection_threshold,
        reflection_threshold_percent: tokens.reflection_percent(config),
        compression_ratio: cycle.and_then(CompactionCycle::compression_ratio),
        duration_ms: cycle.and_then(CompactionCycle::duration_ms),
        error: None,
        warning: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::harness::ScopeId;

    fn tokens() -> TokenAccountantState {
        TokenAccountantState {
            pending_tokens: 850,
            observation_tokens: 1000,
        }
    }

    #[test]
    fn event_carries_both_percentages() {
        let config = ThresholdConfig::new(1000, 2000, ScopeId::default());
        let event = progress_event(CycleKind::Observation, CycleStatus::Buffering, None, tokens(), &config);
        assert_eq!(event.threshold, 1000);
        assert!((event.threshold_percent - 85.0).abs() < f64::EPSILON);
        assert!((event.reflection_threshold_percent - 50.0).abs() < f64::EPSILON);
        assert!(event.cycle_id.is_none());
        assert!(event.compression_ratio.is_none());
    }

    #[tokio::test]
    async fn event_bus_reporter_publishes() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let config = ThresholdConfig::new(1000, 2000, ScopeId::default());
        bus.report(&progress_event(
            CycleKind::Reflection,
            CycleStatus::Running,
            None,
            tokens(),
            &config,
        ));
        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::CompactionProgress(event) => {
                assert_eq!(event.kind, CycleKind::Reflection);
                assert_eq!(event.status, CycleStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn zero_threshold_event_reads_zero_percent() {
        let config = ThresholdConfig::new(0, 0, ScopeId::default());
        let event = progress_event(CycleKind::Observation, CycleStatus::Idle, None, tokens(), &config);
        assert_eq!(event.threshold_percent, 0.0);
        assert_eq!(event.reflection_threshold_percent, 0.0);
    }
}
