//! `folio config`: print the effective engine configuration.

use anyhow::Result;
use console::style;

use folio_infra::sqlite::pool::DATABASE_FILE;
use folio_types::config::EngineConfig;

use crate::state::AppState;

/// Render a config as `config.toml` text, with the clamp applied.
pub fn render_config(config: &EngineConfig) -> Result<String> {
    let mut effective = config.clone();
    effective.concurrency_limit = config.effective_concurrency();
    Ok(toml::to_string_pretty(&effective)?)
}

pub async fn show_config(state: &AppState, json: bool) -> Result<()> {
    let config_path = state.data_dir.join("config.toml");
    let config_exists = tokio::fs::try_exists(&config_path).await.unwrap_or(false);

    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "database": state.data_dir.join(DATABASE_FILE).display().to_string(),
            "config_file": config_exists.then(|| config_path.display().to_string()),
            "config": state.config,
            "effective_concurrency": state.config.effective_concurrency(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Data dir: {}", style(state.data_dir.display()).cyan());
    println!("  Database: {}", state.data_dir.join(DATABASE_FILE).display());
    if config_exists {
        println!("  Config:   {}", config_path.display());
    } else {
        println!("  Config:   {}", style("(defaults, no config.toml)").dim());
    }
    println!();
    for line in render_config(&state.config)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
