use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Identifier reported as `hostingInstanceId`; generated at startup when absent.
    pub instance_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:8080"),
            instance_id: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Cap on live sessions of this instance; further inits are refused until one ends.
    pub max_sessions: usize,
    /// `STRICT` or `AUTO_ACCEPT`, anything else falls back to `AUTO_ACCEPT`.
    pub host_key_policy: String,
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            reaper_interval_secs: 60,
            connect_timeout_secs: 15,
            max_sessions: 1000,
            host_key_policy: String::from("AUTO_ACCEPT"),
            known_hosts_path: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub scratch_dir: PathBuf,
    pub chunk_size: u64,
    pub max_chunk_size: u64,
    pub retention_days: u64,
    pub stalled_threshold_hours: u64,
    pub stale_sweep_interval_secs: u64,
    pub stalled_sweep_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("shellgate").join("transfers"),
            chunk_size: 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            retention_days: 7,
            stalled_threshold_hours: 24,
            stale_sweep_interval_secs: 24 * 60 * 60,
            stalled_sweep_interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityLogConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_secs: 5,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_remote_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_remote_workers: 32,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Database,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: String::from("sqlite://shellgate.sqlite3?mode=rwc"),
        }
    }
}
