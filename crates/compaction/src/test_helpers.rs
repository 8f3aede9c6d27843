//! Shared test helpers for compaction tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_core::error::ProviderError;
use tidemark_core::harness::HarnessState;
use tidemark_core::message::Message;
use tidemark_core::progress::ProgressEvent;
use tidemark_core::provider::{ModelResolver, Provider, ProviderRequest, ProviderResponse, Usage};
use tokio::sync::Notify;

use crate::instance::{MemoryInstance, PipelineSnapshot};
use crate::progress::ProgressReporter;

pub fn text_response(text: &str, completion_tokens: u32) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }),
        model: "mock/model".into(),
    }
}

pub fn harness_state(observation_threshold: u64, reflection_threshold: u64) -> HarnessState {
    HarnessState {
        observation_threshold,
        reflection_threshold,
        observer_model_id: "mock/observer".into(),
        reflector_model_id: "mock/reflector".into(),
        scope_hint: Some("test".into()),
    }
}

/// Returns scripted responses in order; errors once the script runs out.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// `(text, completion_tokens)` pairs.
    pub fn texts(responses: Vec<(&str, u32)>) -> Self {
        Self::new(
            responses
                .into_iter()
                .map(|(text, tokens)| Ok(text_response(text, tokens)))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

/// Holds every call until [`GatedProvider::release`] is called, then
/// answers with the same text.
pub struct GatedProvider {
    gate: Notify,
    text: String,
    completion_tokens: u32,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl GatedProvider {
    pub fn new(text: &str, completion_tokens: u32) -> Self {
        Self {
            gate: Notify::new(),
            text: text.into(),
            completion_tokens,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// The first `n` released calls fail with a network error.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Let one waiting (or the next) call through.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for GatedProvider {
    fn name(&self) -> &str {
        "gated_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Network("connection reset".into()));
        }
        Ok(text_response(&self.text, self.completion_tokens))
    }
}

/// Sleeps before answering.
pub struct SlowProvider {
    delay: Duration,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait::async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(text_response("- late", 10))
    }
}

/// Resolves every model id to one provider, or none at all.
pub struct StaticResolver {
    provider: Option<Arc<dyn Provider>>,
}

impl StaticResolver {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn empty() -> Self {
        Self { provider: None }
    }
}

impl ModelResolver for StaticResolver {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.provider
            .clone()
            .ok_or_else(|| ProviderError::ModelNotFound(model_id.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Wait (at most five seconds) for a snapshot matching `predicate`.
pub async fn wait_for(
    instance: &MemoryInstance,
    predicate: impl Fn(&PipelineSnapshot) -> bool,
) -> PipelineSnapshot {
    let mut rx = instance.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for pipeline state")
        .expect("pipeline stopped");
    snapshot.clone()
}
