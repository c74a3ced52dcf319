use crate::error_handling::types::RemoteError;
use crate::remote::remote_session::{ExecStatus, OutputStream, RemoteSession};
use crate::remote::worker_pool::RemoteWorkerPool;
use crate::resilience::breaker_registry::{exec_breaker_name, CircuitBreakerRegistry};
use crate::resilience::circuit_breaker::CircuitBreakerError;
use crate::session_management::active_session::ActiveSession;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Extra time granted to a binding to close its channel after the deadline before the
/// executor stops waiting for it.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub duration_ms: u64,
}

/// Receives output as it is produced.
pub type OutputListener = Box<dyn FnMut(OutputStream, &[u8]) + Send>;

/// Runs single commands over live sessions, one breaker per target host.
pub struct RemoteCommandExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    pool: Arc<RemoteWorkerPool>,
    force_close_grace: Duration,
}

impl RemoteCommandExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, pool: Arc<RemoteWorkerPool>) -> Self {
        Self {
            breakers,
            pool,
            force_close_grace: FORCE_CLOSE_GRACE,
        }
    }

    pub fn with_force_close_grace(mut self, grace: Duration) -> Self {
        self.force_close_grace = grace;
        self
    }

    pub async fn execute(
        &self,
        session: &ActiveSession,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, RemoteError> {
        self.execute_streaming(session, command, timeout, None)
            .await
    }

    /// Same as [`RemoteCommandExecutor::execute`], also forwarding output to `listener`.
    pub async fn execute_streaming(
        &self,
        session: &ActiveSession,
        command: &str,
        timeout: Duration,
        listener: Option<OutputListener>,
    ) -> Result<CommandResult, RemoteError> {
        let breaker = self.breakers.get(&exec_breaker_name(session.host()));
        let connection = session.connection.clone();
        let command_line = command.to_string();
        debug!(
            "Executing on {} for session {}: {}",
            session.host(),
            session.metadata.session_id,
            command
        );

        // Queue for a worker outside the breaker and the deadline: a busy pool says nothing
        // about the health of this host.
        let permit = self.pool.reserve().await?;
        let grace = self.force_close_grace;
        let outcome = breaker
            .call_async(|| async move {
                let job = permit.run(move || {
                    run_command(connection.as_ref(), &command_line, timeout, listener)
                });
                match tokio::time::timeout(timeout + grace, job).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Remote binding ignored the command deadline");
                        Err(RemoteError::CommandTimeout(timeout))
                    }
                }
            })
            .await;

        match outcome {
            Ok(result) => {
                info!(
                    "Command on {} exited with {} after {} ms",
                    session.host(),
                    result.exit_status,
                    result.duration_ms
                );
                Ok(result)
            }
            Err(CircuitBreakerError::Open(name)) => Err(RemoteError::CircuitOpen(name)),
            Err(CircuitBreakerError::Inner(e)) => {
                warn!("Command on {} failed: {}", session.host(), e);
                Err(e)
            }
        }
    }
}

fn run_command(
    connection: &dyn RemoteSession,
    command: &str,
    timeout: Duration,
    mut listener: Option<OutputListener>,
) -> Result<CommandResult, RemoteError> {
    let started = Instant::now();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let status = connection.exec(command, started + timeout, &mut |stream, bytes| {
        match stream {
            OutputStream::Stdout => stdout.extend_from_slice(bytes),
            OutputStream::Stderr => stderr.extend_from_slice(bytes),
        }
        if let Some(listener) = listener.as_mut() {
            listener(stream, bytes);
        }
    })?;

    match status {
        ExecStatus::Exited(exit_status) => Ok(CommandResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        ExecStatus::TimedOut => Err(RemoteError::CommandTimeout(timeout)),
    }
}
