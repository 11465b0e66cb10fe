//! Service configuration.
//!
//! Everything is read from environment variables (a `.env` file is loaded
//! first by `main`). Lookups go through a closure so tests can supply their
//! own values without mutating the process environment.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::pricing::PriceTable;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_PANGEA_URL: &str = "https://pangeabnp.pdpj.jus.br/api/v1/precedentes";
const DEFAULT_PANGEA_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MONITOR_WINDOW_MS: u64 = 2 * 60 * 60 * 1000;
const DEFAULT_MONITOR_THRESHOLD_USERS: usize = 10;
const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MODEL: &str = "gpt-4o";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub pangea: PangeaConfig,
    pub monitor: MonitorConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone)]
pub struct PangeaConfig {
    pub api_url: String,
    pub timeout: Duration,
}

/// Thresholds for the service failure monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window: Duration,
    pub threshold_users: usize,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Jobs per page returned by job listings.
    pub page_size: usize,
    pub prices: PriceTable,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("APOIA_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let pangea = PangeaConfig {
            api_url: lookup("PANGEA_API_URL").unwrap_or_else(|| DEFAULT_PANGEA_URL.to_string()),
            timeout: Duration::from_secs(parse_var(
                &lookup,
                "PANGEA_TIMEOUT_SECS",
                DEFAULT_PANGEA_TIMEOUT_SECS,
            )?),
        };

        let monitor = MonitorConfig {
            window: Duration::from_millis(parse_var(
                &lookup,
                "SERVICE_MONITOR_WINDOW_MS",
                DEFAULT_MONITOR_WINDOW_MS,
            )?),
            threshold_users: parse_var(
                &lookup,
                "SERVICE_MONITOR_THRESHOLD_USERS",
                DEFAULT_MONITOR_THRESHOLD_USERS,
            )?,
        };

        let page_size: usize = parse_var(&lookup, "BATCH_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            anyhow::bail!("BATCH_PAGE_SIZE must be greater than zero");
        }

        let default_model = lookup("DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let prices = match lookup("MODEL_PRICES") {
            Some(raw) => PriceTable::parse(&raw, default_model)
                .with_context(|| format!("Failed to parse MODEL_PRICES: {:?}", raw))?,
            None => PriceTable::builtin(default_model),
        };

        Ok(Self {
            bind_addr,
            pangea,
            monitor,
            batch: BatchConfig { page_size, prices },
        })
    }

    /// Configuration with every value at its default.
    #[cfg(test)]
    pub fn defaults() -> Self {
        Self::from_lookup(|_| None)
            .expect("default configuration is always valid")
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
