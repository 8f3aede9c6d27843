pub mod config_cmd;
pub mod memory;
pub mod simulate;

use std::path::Path;
use std::sync::Arc;
use tidemark_config::AppConfig;
use tidemark_core::storage::ObservationStore;
use tidemark_memory::{FileStore, InMemoryStore, NoopStore};

/// Load config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_at(path),
        None => AppConfig::load(),
    };
    Ok(config.map_err(|e| format!("Failed to load config: {e}"))?)
}

/// The observation store the config asks for.
pub fn open_store(config: &AppConfig) -> Arc<dyn ObservationStore> {
    match config.storage.backend.as_str() {
        "memory" => Arc::new(InMemoryStore::new()),
        "none" => Arc::new(NoopStore),
        _ => Arc::new(FileStore::new(config.storage_dir())),
    }
}
