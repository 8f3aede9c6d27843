//! `tidemark simulate` — Replay a transcript through the compaction engine.
//!
//! The transcript is JSON Lines, one message per line:
//!
//! ```text
//! {"role": "user", "content": "Let's port the parser to Rust.", "tokens": 1200}
//! {"role": "assistant", "content": "Sounds good. Starting with the lexer."}
//! ```
//!
//! `tokens` is optional; without it the message size is estimated. Models
//! resolve through the offline router, so no API key is needed.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tidemark_compaction::{
    CompactionEngine, MemoryContext, NoopReporter, PipelineSnapshot, ProgressReporter, RequestContext,
    dynamic_memory,
};
use tidemark_config::AppConfig;
use tidemark_core::harness::TokenCount;
use tidemark_core::message::{Message, Role};
use tidemark_core::progress::{CycleStatus, ProgressEvent};
use tidemark_core::storage::ObservationStore;
use tidemark_memory::InMemoryStore;
use tidemark_providers::ProviderRouter;

use super::{load_config, open_store};

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tokens: Option<TokenCount>,
}

pub struct SimulateOptions {
    pub transcript: PathBuf,
    pub observation_threshold: Option<TokenCount>,
    pub reflection_threshold: Option<TokenCount>,
    pub scope: Option<String>,
    pub ephemeral: bool,
    pub show_context: bool,
    pub json: bool,
}

/// Prints one line per progress event.
struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        println!("{}", format_progress(event));
    }
}

pub async fn run(config_path: Option<&Path>, opts: SimulateOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config_path)?;
    if let Some(threshold) = opts.observation_threshold {
        config.observation.threshold = threshold;
    }
    if let Some(threshold) = opts.reflection_threshold {
        config.reflection.threshold = threshold;
    }
    if let Some(scope) = opts.scope {
        config.scope = scope;
    }
    config.validate()?;

    let text = std::fs::read_to_string(&opts.transcript)
        .map_err(|e| format!("Failed to read {}: {e}", opts.transcript.display()))?;
    let entries = parse_transcript(&text)?;
    tracing::debug!(path = %opts.transcript.display(), entries = entries.len(), "Loaded transcript");
    let store: Arc<dyn ObservationStore> = if opts.ephemeral {
        Arc::new(InMemoryStore::new())
    } else {
        open_store(&config)
    };
    let reporter: Arc<dyn ProgressReporter> = if opts.json {
        Arc::new(NoopReporter)
    } else {
        println!(
            "🌊 Replaying {} messages (observe at {}, reflect at {}, scope '{}')",
            entries.len(),
            config.observation.threshold,
            config.reflection.threshold,
            config.scope
        );
        Arc::new(ConsoleReporter)
    };

    let message_count = entries.len();
    let (snapshot, context) = simulate(&config, entries, store, reporter).await?;

    if opts.json {
        let out = serde_json::json!({ "snapshot": snapshot, "context": context });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("📊 Simulation summary");
    println!("=====================");
    println!("  Messages:        {message_count}");
    println!(
        "  Observations:    {} completed, {} failed",
        snapshot.observation.completed_cycles, snapshot.observation.failed_cycles
    );
    println!(
        "  Reflections:     {} completed, {} failed",
        snapshot.reflection.completed_cycles, snapshot.reflection.failed_cycles
    );
    println!(
        "  Pending:         {} / {} ({:.1}%)",
        snapshot.tokens.pending_tokens,
        snapshot.config.observation_threshold,
        snapshot.observation_percent()
    );
    println!(
        "  Observation set: {} / {} ({:.1}%)",
        snapshot.tokens.observation_tokens,
        snapshot.config.reflection_threshold,
        snapshot.reflection_percent()
    );
    println!("  Raw messages:    {}", snapshot.unobserved_messages);

    if opts.show_context {
        println!();
        if !context.observations.is_empty() {
            println!("{}", context.observations);
        }
        for message in &context.messages {
            println!("[{}] {}", message.role, message.content);
        }
    }

    Ok(())
}

/// Feed `entries` through a fresh engine and wait until no cycle is running.
pub async fn simulate(
    config: &AppConfig,
    entries: Vec<TranscriptEntry>,
    store: Arc<dyn ObservationStore>,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<(PipelineSnapshot, MemoryContext), Box<dyn std::error::Error>> {
    let state = config.harness_state();
    let engine = Arc::new(CompactionEngine::new(
        &state,
        config.compaction_settings(),
        Arc::new(ProviderRouter::offline()),
        reporter,
    ));
    let memory = dynamic_memory(engine, store);
    let request = RequestContext::new(Arc::new(state));

    // One lookup per message, the way a harness asks once per request
    for entry in entries {
        let instance = memory(&request);
        let message = Message::new(entry.role, entry.content);
        match entry.tokens {
            Some(tokens) => instance.ingest_counted(message, tokens),
            None => instance.ingest(message),
        }
    }

    let instance = memory(&request);
    instance.settle().await?;
    let mut rx = instance.watch();
    let limit = Duration::from_secs(config.invocation_timeout_secs.saturating_mul(2));
    tokio::time::timeout(limit, rx.wait_for(|s| !is_running(s)))
        .await
        .map_err(|_| "timed out waiting for compaction to finish")??;

    let snapshot = instance.snapshot();
    let context = instance.context().await?;
    Ok((snapshot, context))
}

fn is_running(snapshot: &PipelineSnapshot) -> bool {
    snapshot.observation.status == CycleStatus::Running || snapshot.reflection.status == CycleStatus::Running
}

/// Parse JSON Lines, skipping blank lines.
pub fn parse_transcript(text: &str) -> Result<Vec<TranscriptEntry>, String> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| format!("transcript line {}: {e}", idx + 1))
        })
        .collect()
}

fn format_progress(event: &ProgressEvent) -> String {
    let mut line = format!(
        "  [{}] {:<9} pending {}/{} ({:.1}%) · observations {}/{} ({:.1}%)",
        event.kind,
        format!("{:?}", event.status).to_lowercase(),
        event.pending_tokens,
        event.threshold,
        event.threshold_percent,
        event.observation_tokens,
        event.reflection_threshold,
        event.reflection_threshold_percent,
    );
    if let Some(ratio) = event.compression_ratio {
        line.push_str(&format!(" · {ratio:.1}x"));
    }
    if let Some(ms) = event.duration_ms {
        line.push_str(&format!(" in {ms}ms"));
    }
    if let Some(warning) = &event.warning {
        line.push_str(&format!(" ⚠️  {warning}"));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" ❌ {error}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tidemark_core::progress::CycleKind;

    fn config(observation: TokenCount, reflection: TokenCount) -> AppConfig {
        let mut config = AppConfig::default();
        config.observation.threshold = observation;
        config.reflection.threshold = reflection;
        config.scope = "sim".into();
        config
    }

    #[test]
    fn parses_jsonl_and_skips_blank_lines() {
        let text = r#"{"role": "user", "content": "hi", "tokens": 10}

{"role": "assistant", "content": "hello"}"#;
        let entries = parse_transcript(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tokens, Some(10));
        assert_eq!(entries[1].role, Role::Assistant);
        assert!(entries[1].tokens.is_none());
    }

    #[test]
    fn reports_bad_line_number() {
        let text = "{\"role\": \"user\", \"content\": \"ok\"}\nnot json";
        let err = parse_transcript(text).unwrap_err();
        assert!(err.starts_with("transcript line 2"));
    }

    #[tokio::test]
    async fn simulation_compacts_the_transcript() {
        let entries: Vec<TranscriptEntry> = (0..3)
            .map(|i| TranscriptEntry {
                role: Role::User,
                content: format!("Decision {i} was made. The rest is chatter."),
                tokens: Some(400),
            })
            .collect();
        let (snapshot, context) = simulate(
            &config(1000, 5000),
            entries,
            Arc::new(InMemoryStore::new()),
            Arc::new(NoopReporter),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.observation.completed_cycles, 1);
        assert_eq!(snapshot.tokens.pending_tokens, 0);
        assert!(snapshot.tokens.observation_tokens > 0);
        assert!(context.messages.is_empty());
        assert!(context.observations.contains("Decision 2 was made."));
        assert!(!context.observations.contains("chatter"));
    }

    #[test]
    fn progress_line_includes_ratio_and_error() {
        let event = ProgressEvent {
            kind: CycleKind::Observation,
            status: CycleStatus::Complete,
            cycle_id: Some(1),
            pending_tokens: 0,
            threshold: 1000,
            threshold_percent: 0.0,
            observation_tokens: 200,
            reflection_threshold: 2000,
            reflection_threshold_percent: 10.0,
            compression_ratio: Some(5.25),
            duration_ms: Some(12),
            error: Some("boom".into()),
            warning: None,
            timestamp: Utc::now(),
        };
        let line = format_progress(&event);
        assert!(line.contains("[observation] complete"));
        assert!(line.contains("5.2x") || line.contains("5.3x"));
        assert!(line.contains("in 12ms"));
        assert!(line.contains("boom"));
    }
}
