//! `tidemark config` — Configuration management commands.

use std::path::Path;
use tidemark_config::AppConfig;

use super::load_config;

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match load_config(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            let ceiling = u64::from(
                config
                    .observation
                    .max_output_tokens
                    .max(config.reflection.max_output_tokens),
            );
            if ceiling >= config.reflection.threshold {
                warnings.push("Worker output ceiling reaches the reflection threshold");
            }
            if config.observation.threshold >= config.reflection.threshold {
                warnings.push("Observation threshold is not below the reflection threshold");
            }
            if config.storage.backend == "none" {
                warnings.push("Storage backend is 'none'; observations are lost on exit");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Scope:       {}", config.scope);
            println!(
                "   Observation: {} tokens via {}",
                config.observation.threshold, config.observation.model
            );
            println!(
                "   Reflection:  {} tokens via {}",
                config.reflection.threshold, config.reflection.model
            );
            println!("   Storage:     {}", config.storage.backend);
        }
        Err(e) => {
            println!("   ❌ {e}");
            return Err(e);
        }
    }

    Ok(())
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

/// Write the default config, refusing to overwrite unless `force`.
pub async fn init(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = path.map_or_else(AppConfig::config_path, Path::to_path_buf);
    if target.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            target.display()
        )
        .into());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, AppConfig::default_toml())?;
    println!("✅ Wrote default configuration to {}", target.display());
    Ok(())
}
