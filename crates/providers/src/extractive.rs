//! Extractive summarizer — a deterministic, offline provider.
//!
//! Keeps the leading sentence of every non-empty line of the last user
//! message and stops once the output reaches `max_tokens`. It is nowhere
//! near as good as a real model, but it compresses, it never fails, and it
//! needs no network, which is what the CLI simulator and tests want.

use async_trait::async_trait;
use tidemark_core::error::ProviderError;
use tidemark_core::message::{Message, Role};
use tidemark_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use tidemark_core::tokens::{estimate_messages_tokens, estimate_tokens};

/// Output budget used when the request does not set one.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct ExtractiveProvider {
    bullet: &'static str,
}

impl ExtractiveProvider {
    pub fn new() -> Self {
        Self { bullet: "- " }
    }

    /// First sentence of a line, punctuation included.
    fn lead_sentence(line: &str) -> &str {
        let line = line.trim();
        for (idx, ch) in line.char_indices() {
            if matches!(ch, '.' | '!' | '?') {
                let end = idx + ch.len_utf8();
                let at_boundary = line[end..].chars().next().is_none_or(char::is_whitespace);
                if at_boundary {
                    return &line[..end];
                }
            }
        }
        line
    }

    fn summarize(&self, input: &str, max_tokens: u32) -> String {
        let budget = u64::from(max_tokens);
        let mut out = String::new();
        for line in input.lines().filter(|l| !l.trim().is_empty()) {
            let sentence = Self::lead_sentence(line);
            let candidate = format!("{}{}\n", self.bullet, sentence);
            if estimate_tokens(&out) + estimate_tokens(&candidate) > budget {
                break;
            }
            out.push_str(&candidate);
        }
        out.trim_end().to_string()
    }
}

impl Default for ExtractiveProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ExtractiveProvider {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let input = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let text = self.summarize(input, request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));
        let prompt_tokens = estimate_messages_tokens(&request.messages) as u32;
        let completion_tokens = estimate_tokens(&text) as u32;

        Ok(ProviderResponse {
            message: Message::assistant(text),
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            model: request.model,
        })
    }
}
