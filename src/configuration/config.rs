use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum length of the HMAC secret, 256 bits.
pub const MIN_SECRET_BYTES: usize = 32;

pub const ENV_TOKEN_SECRET: &str = "SHELLGATE_TOKEN_SECRET";
pub const ENV_BIND_ADDRESS: &str = "SHELLGATE_BIND_ADDRESS";
pub const ENV_DATABASE_URL: &str = "SHELLGATE_DATABASE_URL";

/// Command line of the `shellgate` binary.
///
/// Only the location of the configuration file is taken from the command line, every runtime
/// parameter lives in the TOML file or in the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "shellgate")]
#[command(version)]
#[command(about = "Remote session and transfer proxy")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    ///
    /// # Environment
    /// Falls back to `SHELLGATE_CONFIG` when the positional argument is omitted
    #[arg(env = "SHELLGATE_CONFIG")]
    pub config_file: PathBuf,
}

impl CliArgs {
    pub fn from_args() -> Self {
        CliArgs::parse()
    }
}

/// Application configuration, one field per TOML section.
///
/// Every section is optional; missing keys take the defaults documented on the section
/// types. The token secret has no default and must come from the file or from
/// `SHELLGATE_TOKEN_SECRET`.
///
/// # Example
///
/// ```toml
/// [server]
/// bind_address = "127.0.0.1:8080"
///
/// [session]
/// idle_timeout_secs = 900
/// host_key_policy = "STRICT"
/// known_hosts_path = "/var/lib/shellgate/known_hosts.json"
///
/// [transfer]
/// chunk_size = 1048576
/// retention_days = 7
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub command: CommandConfig,
    pub transfer: TransferConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub activity_log: ActivityLogConfig,
    pub workers: WorkerConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Reads, overrides from the environment, and validates the configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(ENV_TOKEN_SECRET) {
            if self.token.secret.is_some() {
                warn!("{} overrides the secret found in the configuration file", ENV_TOKEN_SECRET);
            }
            self.token.secret = Some(secret);
        }
        if let Ok(address) = std::env::var(ENV_BIND_ADDRESS) {
            self.server.bind_address = address;
        }
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.storage.database_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.token.secret {
            None => return Err(ConfigError::MissingSecret),
            Some(secret) if secret.len() < MIN_SECRET_BYTES => {
                return Err(ConfigError::WeakSecret(secret.len()))
            }
            Some(_) => {}
        }
        self.bind_address()?;

        let positive = [
            ("token.ttl_secs", self.token.ttl_secs),
            ("session.idle_timeout_secs", self.session.idle_timeout_secs),
            ("session.reaper_interval_secs", self.session.reaper_interval_secs),
            ("session.connect_timeout_secs", self.session.connect_timeout_secs),
            ("session.max_sessions", self.session.max_sessions as u64),
            ("command.default_timeout_ms", self.command.default_timeout_ms),
            ("transfer.chunk_size", self.transfer.chunk_size),
            ("transfer.retention_days", self.transfer.retention_days),
            ("transfer.stalled_threshold_hours", self.transfer.stalled_threshold_hours),
            ("transfer.stale_sweep_interval_secs", self.transfer.stale_sweep_interval_secs),
            ("transfer.stalled_sweep_interval_secs", self.transfer.stalled_sweep_interval_secs),
            ("circuit_breaker.failure_threshold", self.circuit_breaker.failure_threshold as u64),
            ("circuit_breaker.reset_timeout_secs", self.circuit_breaker.reset_timeout_secs),
            ("activity_log.batch_size", self.activity_log.batch_size as u64),
            ("activity_log.flush_interval_secs", self.activity_log.flush_interval_secs),
            ("workers.max_remote_workers", self.workers.max_remote_workers as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotInRange(format!("{} must be greater than 0", name)));
        }

        if self.transfer.chunk_size > self.transfer.max_chunk_size {
            return Err(ConfigError::NotInRange(format!(
                "transfer.chunk_size {} exceeds transfer.max_chunk_size {}",
                self.transfer.chunk_size, self.transfer.max_chunk_size
            )));
        }
        if self.command.default_timeout_ms > self.command.max_timeout_ms {
            return Err(ConfigError::NotInRange(format!(
                "command.default_timeout_ms {} exceeds command.max_timeout_ms {}",
                self.command.default_timeout_ms, self.command.max_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::BadAddress(self.server.bind_address.clone()))
    }

    pub fn instance_id(&self) -> String {
        self.server
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("instance-{}", uuid::Uuid::new_v4()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token.ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.transfer.retention_days * 24 * 60 * 60)
    }

    pub fn stalled_threshold(&self) -> Duration {
        Duration::from_secs(self.transfer.stalled_threshold_hours * 60 * 60)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker.reset_timeout_secs)
    }
}
