//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The broker URL may embed credentials, so it is wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;
pub mod tiers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use tiers::{ResolvedTier, TierProfile, TierTable};

#[derive(Debug)]
pub struct Config {
    pub broker_url: SecretString,
    pub bind_addr: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub heartbeat_interval: Duration,
    /// Frames buffered per socket before the client is evicted as a slow
    /// consumer.
    pub outbound_buffer: usize,
    pub tiers_file: Option<PathBuf>,
    pub worker_command: Option<PathBuf>,
    pub projects_root: Option<PathBuf>,
    pub task_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let outbound_buffer: usize = parsed_var("RELAY_OUTBOUND_BUFFER", 256)?;
        if outbound_buffer == 0 {
            return Err(Error::Config(
                "RELAY_OUTBOUND_BUFFER must be greater than zero".to_string(),
            ));
        }
        let heartbeat_secs: u64 = parsed_var("RELAY_HEARTBEAT_SECS", 30)?;
        if heartbeat_secs == 0 {
            return Err(Error::Config(
                "RELAY_HEARTBEAT_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            broker_url: SecretString::from(required_var("BROKER_URL")?),
            bind_addr: parsed_var("RELAY_BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            outbound_buffer,
            tiers_file: std::env::var("RELAY_TIERS_FILE").ok().map(PathBuf::from),
            worker_command: std::env::var("RELAY_WORKER_COMMAND").ok().map(PathBuf::from),
            projects_root: std::env::var("RELAY_PROJECTS_ROOT").ok().map(PathBuf::from),
            task_retention: Duration::from_secs(parsed_var("RELAY_TASK_RETENTION_SECS", 3600)?),
        })
    }

    /// Load the tier table from `tiers_file`, or the built-in table.
    pub fn load_tiers(&self) -> Result<TierTable> {
        match &self.tiers_file {
            Some(path) => TierTable::load(path),
            None => Ok(TierTable::builtin()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
