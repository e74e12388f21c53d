// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::exchange::timer::DEFAULT_TIMER_THREAD_NAME;

// Configuration structures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub demo: DemoSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Used when neither the call nor the channel URL gives a positive timeout.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_timer_thread_name")]
    pub timer_thread_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoSettings {
    #[serde(default = "default_calls")]
    pub calls: u64,
    #[serde(default = "default_server_latency_ms")]
    pub server_latency_ms: u64,
    /// Every n-th request is never answered, so its deadline fires.
    #[serde(default = "default_unanswered_every")]
    pub unanswered_every: u64,
}

// Default values
fn default_timeout_ms() -> u64 { 1000 }
fn default_timer_thread_name() -> String { DEFAULT_TIMER_THREAD_NAME.to_string() }
fn default_calls() -> u64 { 6 }
fn default_server_latency_ms() -> u64 { 50 }
fn default_unanswered_every() -> u64 { 3 }

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            timer_thread_name: default_timer_thread_name(),
        }
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            calls: default_calls(),
            server_latency_ms: default_server_latency_ms(),
            unanswered_every: default_unanswered_every(),
        }
    }
}

impl ExchangeConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", Path::new("rust_exchange.json")),
        ("Current directory (alternative)", Path::new("config/rust_exchange.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rust_exchange.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!("Could not find rust_exchange.json configuration file.
        Please create one in the current directory or your home directory."))
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    let config: AppConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON")?;

    if config.exchange.default_timeout_ms == 0 {
        return Err(anyhow!("Configuration error: exchange.default_timeout_ms must be positive"));
    }
    if config.exchange.timer_thread_name.is_empty() {
        return Err(anyhow!("Configuration error: exchange.timer_thread_name cannot be empty"));
    }

    Ok(config)
}

pub fn load_config() -> Result<AppConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

/// Loads the config file when one exists, falling back to built-in defaults.
pub fn load_config_or_default() -> Result<AppConfig> {
    match find_config_file() {
        Ok(path) => load_config_from(&path),
        Err(_) => {
            info!("No configuration file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&AppConfig::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
