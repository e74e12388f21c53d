use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;

use crate::config::ExchangeConfig;

pub const DEFAULT_TIMEOUT_VAR: &str = "RPC_DEFAULT_TIMEOUT_MS";
pub const TIMER_THREAD_NAME_VAR: &str = "RPC_TIMER_THREAD_NAME";

/// Applies environment overrides (after reading `.env`, if present).
pub fn apply_env_overrides(config: &mut ExchangeConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides(config, |key| env::var(key).ok())
}

fn apply_overrides<F>(config: &mut ExchangeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(DEFAULT_TIMEOUT_VAR) {
        let timeout: u64 = val
            .trim()
            .parse()
            .context(format!("{} must be a number of milliseconds", DEFAULT_TIMEOUT_VAR))?;
        if timeout > 0 {
            config.default_timeout_ms = timeout;
        }
    }

    if let Some(name) = lookup(TIMER_THREAD_NAME_VAR) {
        if !name.is_empty() {
            config.timer_thread_name = name;
        }
    }

    Ok(())
}
