//! Config command handlers.

use anyhow::{Context, Result};
use ap_core::config::{self, Config};

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

/// Prints the settings in effect after file and env overrides are merged.
pub fn show(config: &Config) -> Result<()> {
    let config_path = config::paths::config_path();
    let source = if config_path.exists() {
        config_path.display().to_string()
    } else {
        "defaults (no config file)".to_string()
    };
    println!("# source: {source}");
    match config.require_base_url() {
        Ok(base_url) => println!("# backend: {base_url}"),
        Err(_) => println!("# backend: not configured"),
    }
    println!("# cache: {}", config::paths::cache_dir().display());
    print!("{}", config.to_toml()?);
    Ok(())
}
