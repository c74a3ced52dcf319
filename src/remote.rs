//! Remote hosts: the session capability, its SSH binding, host key trust, the blocking worker
//! pool and command execution.

pub mod command_executor;
pub mod host_key_verifier;
pub mod remote_session;
pub mod ssh_client;
#[cfg(test)]
pub mod testing;
pub mod worker_pool;

pub use command_executor::{CommandResult, RemoteCommandExecutor};
pub use host_key_verifier::{HostKeyPolicy, HostKeyVerifier};
pub use remote_session::{ConnectionDetails, RemoteAuth, RemoteConnector, RemoteSession};
pub use worker_pool::RemoteWorkerPool;
