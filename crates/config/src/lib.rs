//! Configuration loading, validation, and management for tidemark.
//!
//! Loads configuration from `~/.tidemark/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tidemark_core::harness::{
    BufferPolicy, CompactionSettings, HarnessState, ScopeId, ThresholdConfig, TokenCount,
};

/// The root configuration structure.
///
/// Maps directly to `~/.tidemark/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scope used when the harness gives no hint
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Upper bound on a single summarization call
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Capacity of the progress event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Observer pipeline
    #[serde(default = "StageConfig::observation")]
    pub observation: StageConfig,

    /// Reflector pipeline
    #[serde(default = "StageConfig::reflection")]
    pub reflection: StageConfig,

    /// Where observation records are kept
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_scope() -> String {
    "default".into()
}
fn default_invocation_timeout_secs() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    256
}

/// Settings for one compaction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Token count at which a cycle must start
    pub threshold: TokenCount,

    /// Fraction of the threshold at which buffering begins
    #[serde(default = "default_buffer_activation")]
    pub buffer_activation: f64,

    /// Backlog multiplier beyond which new cycles are refused
    #[serde(default = "default_block_after")]
    pub block_after: f64,

    /// Model id handed to the resolver
    #[serde(default = "default_model")]
    pub model: String,

    /// Output ceiling for a single worker call
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_buffer_activation() -> f64 {
    0.8
}
fn default_block_after() -> f64 {
    1.2
}
fn default_model() -> String {
    "extractive/lead".into()
}
fn default_max_output_tokens() -> u32 {
    16_000
}

impl StageConfig {
    fn with_threshold(threshold: TokenCount) -> Self {
        Self {
            threshold,
            buffer_activation: default_buffer_activation(),
            block_after: default_block_after(),
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
        }
    }

    pub fn observation() -> Self {
        Self::with_threshold(30_000)
    }

    pub fn reflection() -> Self {
        Self::with_threshold(40_000)
    }

    pub fn policy(&self) -> BufferPolicy {
        BufferPolicy::new(self.buffer_activation, self.block_after)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}.threshold must be greater than 0"
            )));
        }
        if !(self.buffer_activation > 0.0 && self.buffer_activation <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "{name}.buffer_activation must be in (0.0, 1.0]"
            )));
        }
        if self.block_after < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}.block_after must be >= 1.0"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!("{name}.model must not be empty")));
        }
        if self.max_output_tokens == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}.max_output_tokens must be greater than 0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory", "file" or "none"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Directory for the file backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "file".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location with env var overrides.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_at(&Self::config_path())
    }

    /// Same as [`AppConfig::load`] for an explicit file.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("TIDEMARK_OBSERVER_MODEL") {
            self.observation.model = model;
        }
        if let Ok(model) = std::env::var("TIDEMARK_REFLECTOR_MODEL") {
            self.reflection.model = model;
        }
        if let Ok(scope) = std::env::var("TIDEMARK_SCOPE") {
            self.scope = scope;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tidemark")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.observation.validate("observation")?;
        self.reflection.validate("reflection")?;

        if self.invocation_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "invocation_timeout_secs must be greater than 0".into(),
            ));
        }

        if !matches!(self.storage.backend.as_str(), "memory" | "file" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "unknown storage backend '{}' (expected memory, file or none)",
                self.storage.backend
            )));
        }

        let ceiling = u64::from(self.observation.max_output_tokens.max(self.reflection.max_output_tokens));
        if ceiling >= self.reflection.threshold {
            tracing::warn!(
                ceiling,
                reflection_threshold = self.reflection.threshold,
                "Worker output ceiling reaches the reflection threshold; oversized outputs will be rejected"
            );
        }

        Ok(())
    }

    /// The harness state this configuration describes.
    pub fn harness_state(&self) -> HarnessState {
        HarnessState {
            observation_threshold: self.observation.threshold,
            reflection_threshold: self.reflection.threshold,
            observer_model_id: self.observation.model.clone(),
            reflector_model_id: self.reflection.model.clone(),
            scope_hint: Some(self.scope.clone()),
        }
    }

    pub fn threshold_config(&self) -> ThresholdConfig {
        ThresholdConfig::new(
            self.observation.threshold,
            self.reflection.threshold,
            ScopeId::new(&self.scope),
        )
    }

    pub fn compaction_settings(&self) -> CompactionSettings {
        CompactionSettings {
            observation: self.observation.policy(),
            reflection: self.reflection.policy(),
            observer_max_output_tokens: self.observation.max_output_tokens,
            reflector_max_output_tokens: self.reflection.max_output_tokens,
            invocation_timeout_secs: self.invocation_timeout_secs,
            default_scope: ScopeId::new(&self.scope),
        }
    }

    /// Directory for the file storage backend.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("observations"))
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            event_capacity: default_event_capacity(),
            observation: StageConfig::observation(),
            reflection: StageConfig::reflection(),
            storage: StorageConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.observation.threshold, 30_000);
        assert_eq!(config.reflection.threshold, 40_000);
        assert!((config.observation.buffer_activation - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.observation.threshold, config.observation.threshold);
        assert_eq!(parsed.reflection.model, config.reflection.model);
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut config = AppConfig::default();
        config.observation.threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn buffer_activation_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.reflection.buffer_activation = 1.5;
        assert!(config.validate().is_err());
        config.reflection.buffer_activation = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn block_after_below_one_rejected() {
        let mut config = AppConfig::default();
        config.observation.block_after = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("block_after"));
    }

    #[test]
    fn unknown_storage_backend_rejected() {
        let mut config = AppConfig::default();
        config.storage.backend = "postgres".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.scope, "default");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp,
            r#"
scope = "project-x"

[observation]
threshold = 1000
buffer_activation = 0.5

[reflection]
threshold = 2000
model = "anthropic/claude-haiku-4"
max_output_tokens = 1500
"#
        )
        .unwrap();

        let config = AppConfig::load_from(tmp.path()).unwrap();
        assert_eq!(config.observation.threshold, 1000);
        assert!((config.observation.block_after - 1.2).abs() < f64::EPSILON);
        assert_eq!(config.reflection.model, "anthropic/claude-haiku-4");
        assert_eq!(config.storage.backend, "file");

        let state = config.harness_state();
        assert_eq!(state.scope_hint.as_deref(), Some("project-x"));
        assert_eq!(state.reflector_model_id, "anthropic/claude-haiku-4");

        let settings = config.compaction_settings();
        assert!((settings.observation.buffer_activation - 0.5).abs() < f64::EPSILON);
        assert_eq!(settings.reflector_max_output_tokens, 1500);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "observation = [not toml").unwrap();
        let err = AppConfig::load_from(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[observation]"));
        assert!(toml_str.contains("30000"));
    }
}
