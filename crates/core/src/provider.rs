//! Provider trait — the abstraction over the summarization agent.
//!
//! The compaction workers never talk to an LLM backend directly. They ask a
//! [`ModelResolver`] for the provider behind a model id and then call
//! [`Provider::complete`] with a fixed output-token ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::Message;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-haiku-4", "extractive/lead")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.3
}

impl ProviderRequest {
    /// Build a single-shot request: system instructions, one user input and an output ceiling.
    pub fn generate(
        model: impl Into<String>,
        instructions: &str,
        input: impl Into<String>,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::system(instructions), Message::user(input)],
            temperature: default_temperature(),
            max_tokens: Some(max_output_tokens),
        }
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The core Provider trait.
///
/// Every summarization backend implements this trait. Workers call
/// `complete()` without knowing which provider is behind the model id.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "extractive").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

/// Turns a model id into a callable provider.
///
/// The compaction engine never inspects provider identity; it only needs a
/// handle it can call.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> std::result::Result<Arc<dyn Provider>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn generate_request_shape() {
        let req = ProviderRequest::generate("mock/model", "Summarize.", "hello", 512);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].content, "hello");
        assert_eq!(req.max_tokens, Some(512));
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn request_temperature_defaults_when_missing() {
        let json = r#"{"model":"m","messages":[]}"#;
        let req: ProviderRequest = serde_json::from_str(json).unwrap();
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
        assert!(req.max_tokens.is_none());
    }
}
