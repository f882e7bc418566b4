//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a required var is missing or a
//! numeric var does not parse or is out of range.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::PoolConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file holding the task table.
    pub database_path: PathBuf,
    pub workers: usize,
    pub batch_size: usize,
    pub scratch_dir: PathBuf,
    pub progress_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = PoolConfig::default();
        Ok(Self {
            database_path: PathBuf::from(required_var("BATCHQ_DB")?),
            workers: parsed_var("BATCHQ_WORKERS")?.unwrap_or(defaults.workers),
            batch_size: parsed_var("BATCHQ_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            scratch_dir: std::env::var("BATCHQ_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            progress_interval: match parsed_var::<u64>("BATCHQ_PROGRESS_SECS")? {
                Some(0) => {
                    return Err(Error::Config(
                        "BATCHQ_PROGRESS_SECS must be at least 1".to_string(),
                    ));
                }
                Some(secs) => Duration::from_secs(secs),
                None => defaults.progress_interval,
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            scratch_dir: self.scratch_dir.clone(),
            progress_interval: self.progress_interval,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<V>(name: &str) -> Result<Option<V>>
where
    V: FromStr,
    V::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
