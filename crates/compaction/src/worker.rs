//! Compaction workers — the Observer and the Reflector.
//!
//! Both are the same machine: render an input, ask a model for a compressed
//! version, measure the result. A [`Stage`] supplies what differs (which
//! counter it feeds on, what the model is told, how the input renders), and
//! [`CompactionWorker`] runs it.
//!
//! A worker never touches pipeline state. It returns a [`CompactionOutput`]
//! or a [`CompactionError`], and the pipeline decides whether to apply it.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tidemark_core::error::CompactionError;
use tidemark_core::harness::TokenCount;
use tidemark_core::message::Message;
use tidemark_core::progress::CycleKind;
use tidemark_core::provider::{Provider, ProviderRequest};
use tidemark_core::storage::ObservationRecord;
use tidemark_core::tokens::estimate_tokens;
use tracing::debug;

use crate::accountant::{ConsistencyWarning, TokenAccountant};
use crate::cycle::CompactionCycle;

const OBSERVER_INSTRUCTIONS: &str = "\
You are the observer for a long-running assistant conversation.
Read the conversation below and write dense, factual observations about it:
decisions made, facts learned, user preferences, open tasks, file names and
identifiers that will matter later. One observation per line, starting with
\"- \". Do not address the user and do not continue the conversation.";

const REFLECTOR_INSTRUCTIONS: &str = "\
You are the reflector for a long-running assistant conversation.
Below is the accumulated set of observations. Rewrite it into a shorter set
that keeps everything still relevant: merge duplicates, drop what was
superseded, keep identifiers verbatim. One observation per line, starting
with \"- \".";

// ── Inputs ────────────────────────────────────────────────────────────────

/// A message waiting to be observed, with the token count it was recorded at.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: Message,
    pub tokens: TokenCount,
}

/// What a worker reads.
pub trait WorkerInput: Send + 'static {
    fn render(&self) -> String;
    /// Tokens this input contributed to the stage's counter.
    fn input_tokens(&self) -> TokenCount;
    /// Ids of the items the output will replace.
    fn covered_ids(&self) -> HashSet<String>;
    fn is_empty(&self) -> bool;
}

/// Snapshot of the unobserved conversation taken when an observation starts.
#[derive(Debug, Clone, Default)]
pub struct ConversationWindow {
    pub messages: Vec<PendingMessage>,
}

impl WorkerInput for ConversationWindow {
    fn render(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}] {}", m.message.role, m.message.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn input_tokens(&self) -> TokenCount {
        self.messages.iter().map(|m| m.tokens).sum()
    }

    fn covered_ids(&self) -> HashSet<String> {
        self.messages.iter().map(|m| m.message.id.clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Snapshot of the observation set taken when a reflection starts.
#[derive(Debug, Clone, Default)]
pub struct ObservationSet {
    pub records: Vec<ObservationRecord>,
}

impl WorkerInput for ObservationSet {
    fn render(&self) -> String {
        self.records
            .iter()
            .map(|r| r.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn input_tokens(&self) -> TokenCount {
        self.records.iter().map(|r| r.tokens).sum()
    }

    fn covered_ids(&self) -> HashSet<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ── Stages ────────────────────────────────────────────────────────────────

pub trait Stage: Send + Sync + 'static {
    const KIND: CycleKind;
    type Input: WorkerInput;

    fn instructions() -> &'static str;

    /// Apply a successful result to the counters.
    fn account(
        accountant: &mut TokenAccountant,
        removed: TokenCount,
        produced: TokenCount,
    ) -> Option<ConsistencyWarning>;
}

/// Conversation → observations.
pub struct ObservationStage;

impl Stage for ObservationStage {
    const KIND: CycleKind = CycleKind::Observation;
    type Input = ConversationWindow;

    fn instructions() -> &'static str {
        OBSERVER_INSTRUCTIONS
    }

    fn account(
        accountant: &mut TokenAccountant,
        removed: TokenCount,
        produced: TokenCount,
    ) -> Option<ConsistencyWarning> {
        accountant.record_observation_result(removed, produced)
    }
}

/// Observations → condensed observations.
pub struct ReflectionStage;

impl Stage for ReflectionStage {
    const KIND: CycleKind = CycleKind::Reflection;
    type Input = ObservationSet;

    fn instructions() -> &'static str {
        REFLECTOR_INSTRUCTIONS
    }

    fn account(
        accountant: &mut TokenAccountant,
        removed: TokenCount,
        produced: TokenCount,
    ) -> Option<ConsistencyWarning> {
        accountant.record_reflection_result(removed, produced)
    }
}

// ── Worker ────────────────────────────────────────────────────────────────

/// Result of one successful worker invocation.
#[derive(Debug, Clone)]
pub struct CompactionOutput {
    pub text: String,
    pub input_tokens: TokenCount,
    pub output_tokens: TokenCount,
    /// Ids of the messages or records this output replaces.
    pub covered: HashSet<String>,
    pub model: String,
}

pub struct CompactionWorker<S: Stage> {
    _stage: PhantomData<S>,
}

pub type Observer = CompactionWorker<ObservationStage>;
pub type Reflector = CompactionWorker<ReflectionStage>;

impl<S: Stage> CompactionWorker<S> {
    /// Invoke `model` on `input` under the configuration frozen into `cycle`.
    pub async fn run(
        cycle: &CompactionCycle,
        input: S::Input,
        model: Arc<dyn Provider>,
    ) -> Result<CompactionOutput, CompactionError> {
        let config = cycle.config.as_ref().ok_or_else(|| {
            CompactionError::Config(format!("{} cycle {} was never started", S::KIND, cycle.cycle_id))
        })?;
        if input.is_empty() {
            return Err(CompactionError::Config(format!("{} cycle has no input", S::KIND)));
        }

        let input_tokens = input.input_tokens();
        let request = ProviderRequest::generate(
            config.model_id.clone(),
            S::instructions(),
            input.render(),
            config.max_output_tokens,
        );

        debug!(
            kind = %S::KIND,
            cycle_id = cycle.cycle_id,
            model = %config.model_id,
            provider = model.name(),
            input_tokens,
            "Invoking compaction model"
        );

        let response = tokio::time::timeout(config.timeout, model.complete(request))
            .await
            .map_err(|_| CompactionError::Timeout {
                model: config.model_id.clone(),
                timeout_secs: config.timeout.as_secs(),
            })??;

        let text = response.message.content.trim().to_string();
        if text.is_empty() {
            return Err(CompactionError::EmptyOutput);
        }

        let output_tokens = response
            .usage
            .map(|u| TokenCount::from(u.completion_tokens))
            .filter(|&t| t > 0)
            .unwrap_or_else(|| estimate_tokens(&text));
        if output_tokens >= config.output_limit {
            return Err(CompactionError::OversizedOutput {
                output_tokens,
                limit: config.output_limit,
            });
        }

        Ok(CompactionOutput {
            text,
            input_tokens,
            output_tokens,
            covered: input.covered_ids(),
            model: response.model,
        })
    }
}
