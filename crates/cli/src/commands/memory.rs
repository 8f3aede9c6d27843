//! `tidemark memory` — Inspect and clear stored observations.

use std::path::Path;
use tidemark_core::harness::{ScopeId, TokenCount};
use tidemark_core::storage::{ObservationStore, RecordKind};

use super::{load_config, open_store};

fn scope_or_default(scope: Option<String>, default: &str) -> ScopeId {
    ScopeId::from_hint(scope.as_deref(), &ScopeId::new(default))
}

pub async fn show(
    path: Option<&Path>,
    scope: Option<String>,
    full: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    let scope = scope_or_default(scope, &config.scope);
    let store = open_store(&config);
    let records = store.load(&scope).await?;

    let tokens: TokenCount = records.iter().map(|r| r.tokens).sum();
    let reflections = records.iter().filter(|r| r.kind == RecordKind::Reflection).count();

    println!("🧠 Observations for scope '{scope}'");
    println!("==================================");
    println!("  Store:        {}", store.name());
    println!("  Records:      {} ({} reflections)", records.len(), reflections);
    println!(
        "  Tokens:       {} / {} ({:.1}% of reflection threshold)",
        tokens,
        config.reflection.threshold,
        tokens as f64 / config.reflection.threshold.max(1) as f64 * 100.0
    );

    if full {
        for record in &records {
            println!();
            println!(
                "── {:?} · cycle {} · {} tokens · {}",
                record.kind,
                record.cycle_id,
                record.tokens,
                record.created_at.format("%Y-%m-%d %H:%M")
            );
            println!("{}", record.content.trim());
        }
    }

    Ok(())
}

pub async fn clear(path: Option<&Path>, scope: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    let scope = scope_or_default(scope, &config.scope);
    let store = open_store(&config);
    store.clear(&scope).await?;
    println!("🗑️  Cleared observations for scope '{scope}'");
    Ok(())
}
