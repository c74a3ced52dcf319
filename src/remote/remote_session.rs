//! Capability interface for remote hosts.
//!
//! The rest of the crate only talks to these traits; `ssh_client` binds them to libssh2.
//! Every method blocks, so callers run them on the remote worker pool.

use crate::error_handling::types::RemoteError;
use crate::remote::host_key_verifier::HostKeyVerifier;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub enum RemoteAuth {
    Password(String),
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAuth::Password(_) => write!(f, "Password(***)"),
            RemoteAuth::PrivateKey { .. } => write!(f, "PrivateKey(***)"),
        }
    }
}

/// Validated connection details handed over by the access-control layer.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: RemoteAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    /// The deadline passed and the channel was closed.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

pub trait RemoteConnector: Send + Sync {
    /// Connects and authenticates, asking `verifier` whether the presented host key is trusted
    /// before any credential is sent.
    fn open(
        &self,
        details: &ConnectionDetails,
        verifier: &HostKeyVerifier,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    /// Runs `command`, handing output to `output` as it arrives. Implementations must close the
    /// channel and return `ExecStatus::TimedOut` once `deadline` passes.
    fn exec(
        &self,
        command: &str,
        deadline: Instant,
        output: &mut dyn FnMut(OutputStream, &[u8]),
    ) -> Result<ExecStatus, RemoteError>;

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    fn file_size(&self, path: &str) -> Result<u64, RemoteError>;

    /// Reads `len` bytes of `path` starting at `offset`.
    fn get_file(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, RemoteError>;

    /// Copies a local file to `remote_path`, creating missing parent directories. Returns the
    /// number of bytes written.
    fn put_file(&self, local: &Path, remote_path: &str) -> Result<u64, RemoteError>;

    fn is_connected(&self) -> bool;

    fn close(&self);
}
