//! Harness-facing configuration types.
//!
//! [`HarnessState`] is what the surrounding coding-agent harness exposes
//! about its user-facing configuration. [`ThresholdConfig`] is the immutable
//! snapshot derived from it that decides memory-instance identity, and
//! [`CompactionSettings`] carries the knobs that do not participate in that
//! identity (buffering policy, worker ceilings, timeouts).

use serde::{Deserialize, Serialize};
use crate::error::CompactionError;

/// Token counts are unsigned; subtraction must go through the accountant,
/// which clamps at zero.
pub type TokenCount = u64;

/// The logical partition (e.g. per-project) a memory instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Use the harness hint when it names something, the fallback otherwise.
    pub fn from_hint(hint: Option<&str>, fallback: &ScopeId) -> Self {
        match hint.map(str::trim) {
            Some(h) if !h.is_empty() => Self(h.to_string()),
            _ => fallback.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self("default".into())
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache identity of a memory instance. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Pending (unobserved) tokens at which an observation cycle must start.
    pub observation_threshold: TokenCount,

    /// Observation tokens at which a reflection cycle must start.
    pub reflection_threshold: TokenCount,

    pub scope: ScopeId,
}

impl ThresholdConfig {
    pub fn new(observation_threshold: TokenCount, reflection_threshold: TokenCount, scope: ScopeId) -> Self {
        Self {
            observation_threshold,
            reflection_threshold,
            scope,
        }
    }

    /// Derive the snapshot for a harness state, falling back to `default_scope`
    /// when the harness gives no scope hint.
    pub fn from_state(state: &HarnessState, default_scope: &ScopeId) -> Self {
        Self {
            observation_threshold: state.observation_threshold,
            reflection_threshold: state.reflection_threshold,
            scope: ScopeId::from_hint(state.scope_hint.as_deref(), default_scope),
        }
    }

    pub fn validate(&self) -> Result<(), CompactionError> {
        if self.observation_threshold == 0 {
            return Err(CompactionError::Config(
                "observation threshold must be greater than zero".into(),
            ));
        }
        if self.reflection_threshold == 0 {
            return Err(CompactionError::Config(
                "reflection threshold must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// The user-facing configuration of the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessState {
    pub observation_threshold: TokenCount,
    pub reflection_threshold: TokenCount,
    pub observer_model_id: String,
    pub reflector_model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_hint: Option<String>,
}

/// Anything that can report the harness's current state.
///
/// The request path hands one of these to the memory factory; background
/// workers never see it.
pub trait HarnessStateSource: Send + Sync {
    fn get_state(&self) -> HarnessState;
}

impl HarnessStateSource for HarnessState {
    fn get_state(&self) -> HarnessState {
        self.clone()
    }
}

/// Hysteresis and backpressure knobs for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferPolicy {
    /// Fraction of the threshold at which preparatory buffering begins.
    #[serde(default = "default_buffer_activation")]
    pub buffer_activation: f64,

    /// Backlog multiplier beyond which further starts are refused.
    #[serde(default = "default_block_after")]
    pub block_after: f64,
}

fn default_buffer_activation() -> f64 {
    0.8
}
fn default_block_after() -> f64 {
    1.2
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            buffer_activation: default_buffer_activation(),
            block_after: default_block_after(),
        }
    }
}

impl BufferPolicy {
    pub fn new(buffer_activation: f64, block_after: f64) -> Self {
        Self {
            buffer_activation,
            block_after,
        }
    }

    /// Token count at which buffering begins for a threshold.
    pub fn activation_point(&self, threshold: TokenCount) -> TokenCount {
        (threshold as f64 * self.buffer_activation.clamp(0.0, 1.0)).ceil() as TokenCount
    }

    /// Token count at which backpressure kicks in for a threshold.
    pub fn block_point(&self, threshold: TokenCount) -> TokenCount {
        (threshold as f64 * self.block_after.max(1.0)).ceil() as TokenCount
    }

    /// How many cycles may start without an intervening reduction.
    pub fn max_unreduced_starts(&self) -> u32 {
        (self.block_after.max(1.0).ceil() as u32).max(1)
    }
}

/// Knobs that shape compaction behavior without being part of instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSettings {
    pub observation: BufferPolicy,
    pub reflection: BufferPolicy,

    /// Output ceiling for a single observer call.
    pub observer_max_output_tokens: u32,

    /// Output ceiling for a single reflector call.
    pub reflector_max_output_tokens: u32,

    pub invocation_timeout_secs: u64,

    /// Scope used when the harness gives no hint.
    pub default_scope: ScopeId,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            observation: BufferPolicy::default(),
            reflection: BufferPolicy::default(),
            observer_max_output_tokens: 16_000,
            reflector_max_output_tokens: 16_000,
            invocation_timeout_secs: 300,
            default_scope: ScopeId::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(scope_hint: Option<&str>) -> HarnessState {
        HarnessState {
            observation_threshold: 1000,
            reflection_threshold: 2000,
            observer_model_id: "mock/observer".into(),
            reflector_model_id: "mock/reflector".into(),
            scope_hint: scope_hint.map(String::from),
        }
    }

    #[test]
    fn threshold_config_uses_scope_hint() {
        let config = ThresholdConfig::from_state(&state(Some("project-a")), &ScopeId::default());
        assert_eq!(config.scope, ScopeId::new("project-a"));
        assert_eq!(config.observation_threshold, 1000);
    }

    #[test]
    fn blank_scope_hint_falls_back() {
        let fallback = ScopeId::new("fallback");
        let config = ThresholdConfig::from_state(&state(Some("  ")), &fallback);
        assert_eq!(config.scope, fallback);
        let config = ThresholdConfig::from_state(&state(None), &fallback);
        assert_eq!(config.scope, fallback);
    }

    #[test]
    fn threshold_config_equality_is_structural() {
        let a = ThresholdConfig::new(1000, 2000, ScopeId::new("x"));
        let b = ThresholdConfig::new(1000, 2000, ScopeId::new("x"));
        let c = ThresholdConfig::new(1000, 2000, ScopeId::new("y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_thresholds_rejected() {
        assert!(ThresholdConfig::new(0, 10, ScopeId::default()).validate().is_err());
        assert!(ThresholdConfig::new(10, 0, ScopeId::default()).validate().is_err());
        assert!(ThresholdConfig::new(10, 10, ScopeId::default()).validate().is_ok());
    }

    #[test]
    fn buffer_policy_points() {
        let policy = BufferPolicy::new(0.8, 1.1);
        assert_eq!(policy.activation_point(1000), 800);
        assert_eq!(policy.block_point(1000), 1100);
        assert_eq!(policy.max_unreduced_starts(), 2);
        assert_eq!(BufferPolicy::new(0.8, 1.0).max_unreduced_starts(), 1);
    }
}
