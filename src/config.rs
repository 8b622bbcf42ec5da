//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database DSN is wrapped in `secrecy::SecretString` to
//! keep it out of logs. Everything else has defaults; the engine never
//! consults the environment after this.

use std::time::Duration;

use secrecy::SecretString;

use crate::engine::EngineConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();

        let queues = match std::env::var("WORKER_QUEUES") {
            Ok(raw) => raw
                .split(',')
                .map(|queue| queue.trim().to_string())
                .filter(|queue| !queue.is_empty())
                .collect(),
            Err(_) => defaults.queues,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            engine: EngineConfig {
                queues,
                worker_concurrency: parsed_var(
                    "WORKER_CONCURRENCY",
                    defaults.worker_concurrency,
                )?,
                job_timeout: secs_var("JOB_TIMEOUT_SECS", defaults.job_timeout)?,
                poll_interval: secs_var("POLL_INTERVAL_SECS", defaults.poll_interval)?,
                shutdown_grace: secs_var("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
                stall_threshold: secs_var("STALLED_JOB_THRESHOLD_SECS", defaults.stall_threshold)?,
                reclaim_interval: secs_var(
                    "STALLED_CHECK_INTERVAL_SECS",
                    defaults.reclaim_interval,
                )?,
            },
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parsed_var(
        name,
        default.as_secs(),
    )?))
}
