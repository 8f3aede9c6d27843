//! End-to-end integration tests for the tidemark compaction stack.
//!
//! These tests wire the real crates together the way the CLI does: config
//! from TOML, the offline provider router, the file store, and the engine.

use std::sync::Arc;
use std::time::Duration;

use tidemark_compaction::{
    CompactionEngine, MemoryInstance, NoopReporter, PipelineSnapshot, RequestContext, dynamic_memory,
};
use tidemark_config::AppConfig;
use tidemark_core::error::ProviderError;
use tidemark_core::event::{DomainEvent, EventBus};
use tidemark_core::harness::ScopeId;
use tidemark_core::message::Message;
use tidemark_core::progress::{CycleKind, CycleStatus};
use tidemark_core::provider::{Provider, ProviderRequest, ProviderResponse};
use tidemark_core::storage::{ObservationStore, RecordKind};
use tidemark_memory::FileStore;
use tidemark_providers::ProviderRouter;

// ── Mock Provider ────────────────────────────────────────────────────────

/// Always fails, like a provider whose API is down.
struct DownProvider;

#[async_trait::async_trait]
impl Provider for DownProvider {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::ApiError {
            status_code: 503,
            message: "service unavailable".into(),
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn config(toml_str: &str) -> AppConfig {
    let config: AppConfig = toml::from_str(toml_str).unwrap();
    config.validate().unwrap();
    config
}

fn engine_for(config: &AppConfig, router: ProviderRouter, bus: Arc<EventBus>) -> Arc<CompactionEngine> {
    Arc::new(CompactionEngine::new(
        &config.harness_state(),
        config.compaction_settings(),
        Arc::new(router),
        bus,
    ))
}

async fn wait_for(instance: &MemoryInstance, predicate: impl Fn(&PipelineSnapshot) -> bool) -> PipelineSnapshot {
    let mut rx = instance.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out")
        .expect("pipeline stopped");
    snapshot.clone()
}

fn long_turn(i: usize) -> Message {
    Message::user(format!(
        "Turn {i}: we agreed to keep the parser in its own crate. \
         After that came a long tangent about naming that nobody will need again."
    ))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_observe_reflect_and_persist() {
    let dir = tempfile::TempDir::new().unwrap();
    // Each turn is counted at 100 tokens and observes down to a single
    // 16-token line, so three observations cross the reflection threshold.
    let config = config(&format!(
        r#"
scope = "e2e"

[observation]
threshold = 100

[reflection]
threshold = 40
max_output_tokens = 20

[storage]
backend = "file"
path = "{}"
"#,
        dir.path().display()
    ));
    let store = Arc::new(FileStore::new(config.storage_dir()));
    let bus = Arc::new(EventBus::new(1024));
    let mut events = bus.subscribe();
    let engine = engine_for(&config, ProviderRouter::offline(), bus);
    let memory = dynamic_memory(engine, store.clone());
    let request = RequestContext::new(Arc::new(config.harness_state()));

    for i in 0..3 {
        let instance = memory(&request);
        instance.ingest_counted(long_turn(i), 100);
        wait_for(&instance, |s| s.observation.completed_cycles > i as u64).await;
    }
    let instance = memory(&request);
    let snap = wait_for(&instance, |s| s.reflection.completed_cycles >= 1).await;
    assert_eq!(snap.observation.completed_cycles, 3);
    assert_eq!(snap.records, 1);
    assert!(snap.tokens.observation_tokens < 40);

    let mut saw_reflection_event = false;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::CompactionProgress(p) = event.as_ref() {
            if p.kind == CycleKind::Reflection && p.status == CycleStatus::Complete {
                saw_reflection_event = true;
                assert!(p.compression_ratio.unwrap() > 1.0);
            }
        }
    }
    assert!(saw_reflection_event);

    let stored = store.load(&ScopeId::new("e2e")).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, RecordKind::Reflection);
    assert!(stored[0].content.contains("keep the parser in its own crate."));
}

#[tokio::test]
async fn e2e_restart_reloads_observations() {
    let dir = tempfile::TempDir::new().unwrap();
    let toml_str = format!(
        r#"
scope = "restart"

[observation]
threshold = 60

[reflection]
threshold = 100000

[storage]
path = "{}"
"#,
        dir.path().display()
    );
    let config = config(&toml_str);

    let first_tokens = {
        let engine = engine_for(&config, ProviderRouter::offline(), Arc::new(EventBus::default()));
        let memory = dynamic_memory(engine, Arc::new(FileStore::new(config.storage_dir())));
        let instance = memory(&RequestContext::new(Arc::new(config.harness_state())));
        for i in 0..3 {
            instance.ingest(long_turn(i));
        }
        let snap = wait_for(&instance, |s| {
            s.observation.completed_cycles >= 1 && s.observation.status != CycleStatus::Running
        })
        .await;
        snap.tokens.observation_tokens
    };
    assert!(first_tokens > 0);

    let engine = Arc::new(CompactionEngine::new(
        &config.harness_state(),
        config.compaction_settings(),
        Arc::new(ProviderRouter::offline()),
        Arc::new(NoopReporter),
    ));
    let memory = dynamic_memory(engine, Arc::new(FileStore::new(config.storage_dir())));
    let instance = memory(&RequestContext::new(Arc::new(config.harness_state())));
    let snap = wait_for(&instance, |s| s.loaded).await;
    assert_eq!(snap.tokens.observation_tokens, first_tokens);
    assert_eq!(snap.tokens.pending_tokens, 0);

    let context = instance.context().await.unwrap();
    assert!(context.observations.contains("keep the parser in its own crate."));
}

#[tokio::test]
async fn e2e_failing_provider_keeps_conversation() {
    let config = config(
        r#"
[observation]
threshold = 50
model = "down/model"

[reflection]
threshold = 1000

[storage]
backend = "none"
"#,
    );
    let mut router = ProviderRouter::new();
    router.register("down", Arc::new(DownProvider));
    let engine = engine_for(&config, router, Arc::new(EventBus::default()));
    let memory = dynamic_memory(engine, Arc::new(tidemark_memory::NoopStore));
    let instance = memory(&RequestContext::new(Arc::new(config.harness_state())));

    for i in 0..3 {
        instance.ingest(long_turn(i));
    }
    let snap = wait_for(&instance, |s| s.observation.failed_cycles >= 1).await;
    assert_eq!(snap.observation.completed_cycles, 0);
    assert_eq!(snap.records, 0);
    let last = snap.observation.last.unwrap();
    assert!(last.error.unwrap().contains("503"));

    let context = instance.context().await.unwrap();
    assert_eq!(context.messages.len(), 3);
    assert!(context.observations.is_empty());
}

#[tokio::test]
async fn e2e_unknown_model_leaves_stage_idle() {
    let config = config(
        r#"
[observation]
threshold = 50
model = "nowhere/model"

[reflection]
threshold = 1000

[storage]
backend = "memory"
"#,
    );
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();
    // No default provider: unknown prefixes fail to resolve
    let engine = engine_for(&config, ProviderRouter::new(), bus);
    let memory = dynamic_memory(engine, Arc::new(tidemark_memory::InMemoryStore::new()));
    let instance = memory(&RequestContext::new(Arc::new(config.harness_state())));

    for i in 0..3 {
        instance.ingest(long_turn(i));
    }
    instance.settle().await.unwrap();
    let snap = instance.snapshot();
    assert_eq!(snap.observation.status, CycleStatus::Idle);
    assert_eq!(snap.observation.failed_cycles, 0);
    assert!(snap.tokens.pending_tokens > 0);

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::CompactionProgress(p) = event.as_ref() {
            if p.error.is_some() {
                errors += 1;
            }
        }
    }
    assert_eq!(errors, 1);
}
