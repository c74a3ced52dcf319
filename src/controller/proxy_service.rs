use crate::activity_log::log_batcher::ActivityLogBatcher;
use crate::activity_log::types::{actions, LogEvent};
use crate::controller::output_hub::{OutputHub, StreamFrame};
use crate::error_handling::types::{ProxyError, SessionError};
use crate::remote::command_executor::{CommandResult, OutputListener, RemoteCommandExecutor};
use crate::remote::host_key_verifier::{HostKeyPolicy, HostKeyVerifier, KnownHostKey};
use crate::remote::remote_session::{OutputStream, RemoteEntry};
use crate::resilience::breaker_registry::CircuitBreakerRegistry;
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::session_management::active_session::ActiveSession;
use crate::session_management::session::{SessionKey, SessionMetadata};
use crate::session_management::session_registry::{SessionCredentials, SessionRegistry};
use crate::session_management::token_service::SessionTokenService;
use crate::transfer::transfer_manager::ChunkedTransferManager;
use crate::transfer::types::{ChunkAck, ChunkMetadata, FileTransferRecord, TransferRequest};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

/// Everything the facade delegates to, built by the controller.
pub struct ProxyComponents {
    pub tokens: Arc<SessionTokenService>,
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<RemoteCommandExecutor>,
    pub transfers: Arc<ChunkedTransferManager>,
    pub verifier: Arc<HostKeyVerifier>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub activity: Arc<ActivityLogBatcher>,
    pub hub: Arc<OutputHub>,
    pub commands: CommandLimits,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub instance_id: String,
    pub active_sessions: usize,
    pub streaming_topics: usize,
    pub breakers: Vec<CircuitBreakerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyReport {
    pub policy: HostKeyPolicy,
    pub keys: Vec<KnownHostKey>,
}

/// The operations exposed to clients.
///
/// Every call authenticates its session token, checks ownership where a transfer is involved,
/// delegates, and reports the outcome to the activity log.
pub struct ProxyService {
    tokens: Arc<SessionTokenService>,
    registry: Arc<SessionRegistry>,
    executor: Arc<RemoteCommandExecutor>,
    transfers: Arc<ChunkedTransferManager>,
    verifier: Arc<HostKeyVerifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    activity: Arc<ActivityLogBatcher>,
    hub: Arc<OutputHub>,
    commands: CommandLimits,
}

impl ProxyService {
    pub fn new(components: ProxyComponents) -> Self {
        Self {
            tokens: components.tokens,
            registry: components.registry,
            executor: components.executor,
            transfers: components.transfers,
            verifier: components.verifier,
            breakers: components.breakers,
            activity: components.activity,
            hub: components.hub,
            commands: components.commands,
        }
    }

    pub async fn init_session(
        &self,
        user_id: Uuid,
        credentials: SessionCredentials,
    ) -> Result<SessionMetadata, ProxyError> {
        let resource_id = credentials.resource_id;
        let details = format!(
            "{}@{}:{}",
            credentials.connection.username,
            credentials.connection.host,
            credentials.connection.port
        );
        let result = match self.registry.create_session(user_id, credentials).await {
            Ok(opened) => {
                // Subscribers of the replaced session would otherwise wait forever.
                if let Some(replaced) = &opened.replaced {
                    self.hub.close(replaced.session_id);
                }
                Ok(opened.metadata)
            }
            Err(e) => Err(ProxyError::from(e)),
        };
        self.record(user_id, actions::SESSION_INIT, Some(resource_id), details, &result)
            .await;
        result
    }

    /// Extends the session. An unknown or expired session is `SessionError::NotFound`.
    pub async fn keep_alive(&self, token: &str) -> Result<SessionMetadata, ProxyError> {
        let key = self.authenticate(token)?;
        let result = if self.registry.keep_alive(token).await {
            self.registry
                .metadata(token)
                .await
                .ok_or(ProxyError::Session(SessionError::NotFound))
        } else {
            Err(ProxyError::Session(SessionError::NotFound))
        };
        self.record(
            key.user_id,
            actions::SESSION_KEEPALIVE,
            Some(key.resource_id),
            String::new(),
            &result,
        )
        .await;
        result
    }

    /// Releases the session if there is one. Releasing twice is not an error.
    pub async fn release(&self, token: &str) -> Result<(), ProxyError> {
        let key = self.authenticate(token)?;
        let released = self.registry.release(token).await;
        if let Some(metadata) = &released {
            self.hub.close(metadata.session_id);
        }
        let details = match released {
            Some(metadata) => format!("session {}", metadata.session_id),
            None => "no live session".to_string(),
        };
        self.record(
            key.user_id,
            actions::SESSION_RELEASE,
            Some(key.resource_id),
            details,
            &Ok::<(), ProxyError>(()),
        )
        .await;
        Ok(())
    }

    pub async fn execute(
        &self,
        token: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, ProxyError> {
        self.run_command(token, command, timeout_ms, None).await
    }

    /// Runs a command whose output is also published, frame by frame, on the session's
    /// streaming topic.
    pub async fn execute_streaming(
        &self,
        token: &str,
        command: &str,
        timeout_ms: Option<u64>,
        command_id: &str,
    ) -> Result<CommandResult, ProxyError> {
        self.run_command(token, command, timeout_ms, Some(command_id))
            .await
    }

    pub async fn subscribe_output(
        &self,
        token: &str,
    ) -> Result<(SessionMetadata, broadcast::Receiver<StreamFrame>), ProxyError> {
        let session = self.registry.resolve(token).await?;
        let receiver = self.hub.subscribe(session.metadata.session_id);
        debug!("Output subscriber attached to session {}", session.metadata.session_id);
        Ok((session.metadata, receiver))
    }

    pub async fn list_directory(
        &self,
        token: &str,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, ProxyError> {
        let session = self.registry.resolve(token).await?;
        let result = if path.trim().is_empty() {
            Err(ProxyError::InvalidRequest("path is empty".to_string()))
        } else {
            self.transfers
                .list_directory(&session, path)
                .await
                .map_err(ProxyError::from)
        };
        self.record(
            session.key.user_id,
            actions::DIRECTORY_LIST,
            Some(session.key.resource_id),
            path.to_string(),
            &result,
        )
        .await;
        result
    }

    pub async fn init_transfer(
        &self,
        token: &str,
        request: TransferRequest,
    ) -> Result<FileTransferRecord, ProxyError> {
        let session = self.registry.resolve(token).await?;
        let details = format!(
            "{} {} ({})",
            request.direction.as_str(),
            request.remote_path,
            request.file_name
        );
        let result = self
            .transfers
            .init_transfer(&session, request)
            .await
            .map_err(ProxyError::from);
        let details = match &result {
            Ok(record) => format!("{} -> {}", details, record.transfer_id),
            Err(_) => details,
        };
        self.record(
            session.key.user_id,
            actions::TRANSFER_INIT,
            Some(session.key.resource_id),
            details,
            &result,
        )
        .await;
        result
    }

    pub async fn upload_chunk(
        &self,
        token: &str,
        transfer_id: &str,
        chunk_index: u32,
        offset: u64,
        bytes: &[u8],
        checksum: Option<&str>,
    ) -> Result<ChunkAck, ProxyError> {
        let session = self.registry.resolve(token).await?;
        let result = match self.check_owner(&session.key, transfer_id).await {
            Ok(()) => self
                .transfers
                .upload_chunk(&session, transfer_id, chunk_index, offset, bytes, checksum)
                .await
                .map_err(ProxyError::from),
            Err(e) => Err(e),
        };
        self.record(
            session.key.user_id,
            actions::TRANSFER_CHUNK,
            Some(session.key.resource_id),
            format!("upload {} chunk {}", transfer_id, chunk_index),
            &result,
        )
        .await;
        result
    }

    pub async fn download_chunk(
        &self,
        token: &str,
        transfer_id: &str,
        chunk_index: u32,
    ) -> Result<Vec<u8>, ProxyError> {
        let session = self.registry.resolve(token).await?;
        let result = match self.check_owner(&session.key, transfer_id).await {
            Ok(()) => self
                .transfers
                .download_chunk(&session, transfer_id, chunk_index)
                .await
                .map_err(ProxyError::from),
            Err(e) => Err(e),
        };
        self.record(
            session.key.user_id,
            actions::TRANSFER_CHUNK,
            Some(session.key.resource_id),
            format!("download {} chunk {}", transfer_id, chunk_index),
            &result,
        )
        .await;
        result
    }

    /// Transfer state. Needs a valid token of the owner but no live session.
    pub async fn transfer_status(
        &self,
        token: &str,
        transfer_id: &str,
    ) -> Result<FileTransferRecord, ProxyError> {
        let key = self.authenticate(token)?;
        let record = self.transfers.transfer_status(transfer_id).await?;
        ensure_owner(&key, &record)?;
        Ok(record)
    }

    pub async fn list_chunks(
        &self,
        token: &str,
        transfer_id: &str,
    ) -> Result<Vec<ChunkMetadata>, ProxyError> {
        let key = self.authenticate(token)?;
        self.check_owner(&key, transfer_id).await?;
        Ok(self.transfers.list_chunks(transfer_id).await?)
    }

    pub async fn cancel_transfer(
        &self,
        token: &str,
        transfer_id: &str,
    ) -> Result<FileTransferRecord, ProxyError> {
        let key = self.authenticate(token)?;
        let result = match self.check_owner(&key, transfer_id).await {
            Ok(()) => self
                .transfers
                .cancel_transfer(transfer_id)
                .await
                .map_err(ProxyError::from),
            Err(e) => Err(e),
        };
        self.record(
            key.user_id,
            actions::TRANSFER_CANCEL,
            Some(key.resource_id),
            transfer_id.to_string(),
            &result,
        )
        .await;
        result
    }

    pub fn host_keys(&self) -> HostKeyReport {
        HostKeyReport {
            policy: self.verifier.policy(),
            keys: self.verifier.list(),
        }
    }

    pub fn remove_host_key(&self, host: &str, port: u16) -> bool {
        let removed = self.verifier.remove(host, port);
        if removed {
            info!("Host key of {}:{} removed", host, port);
        }
        removed
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            instance_id: self.registry.instance_id().to_string(),
            active_sessions: self.registry.active_count().await,
            streaming_topics: self.hub.topic_count(),
            breakers: self.breakers.snapshots(),
        }
    }

    /// Releases expired or disconnected sessions and closes their streaming topics.
    pub async fn reap_sessions(&self) -> usize {
        let reaped = self.registry.reap_expired().await;
        for metadata in &reaped {
            self.hub.close(metadata.session_id);
        }
        reaped.len()
    }

    /// Final flush of the activity log and release of every live session.
    pub async fn shutdown(&self) {
        let released = self.registry.release_all().await;
        self.hub.close_all();
        let flushed = self.activity.scheduled_flush().await;
        info!(
            "Shutdown: released {} sessions, flushed {} activity events",
            released, flushed
        );
    }

    async fn run_command(
        &self,
        token: &str,
        command: &str,
        timeout_ms: Option<u64>,
        command_id: Option<&str>,
    ) -> Result<CommandResult, ProxyError> {
        let session = self.registry.resolve(token).await?;
        let result = match self.command_timeout(command, timeout_ms) {
            Ok(timeout) => {
                let listener = command_id.map(|id| self.stream_listener(&session, id));
                self.executor
                    .execute_streaming(&session, command, timeout, listener)
                    .await
                    .map_err(ProxyError::from)
            }
            Err(e) => Err(e),
        };

        if let Some(command_id) = command_id {
            let frame = match &result {
                Ok(output) => StreamFrame::Exit {
                    command_id: command_id.to_string(),
                    exit_status: output.exit_status,
                    duration_ms: output.duration_ms,
                },
                Err(e) => StreamFrame::Error {
                    command_id: command_id.to_string(),
                    message: e.to_string(),
                },
            };
            self.hub.publish(session.metadata.session_id, frame);
        }

        self.record(
            session.key.user_id,
            actions::COMMAND_EXECUTE,
            Some(session.key.resource_id),
            command.to_string(),
            &result,
        )
        .await;
        result
    }

    fn command_timeout(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Duration, ProxyError> {
        if command.trim().is_empty() {
            return Err(ProxyError::InvalidRequest("command is empty".to_string()));
        }
        let timeout = match timeout_ms {
            None => self.commands.default_timeout,
            Some(0) => {
                return Err(ProxyError::InvalidRequest(
                    "timeoutMs must be positive".to_string(),
                ))
            }
            Some(ms) => Duration::from_millis(ms),
        };
        if timeout > self.commands.max_timeout {
            return Err(ProxyError::InvalidRequest(format!(
                "timeoutMs exceeds the maximum of {} ms",
                self.commands.max_timeout.as_millis()
            )));
        }
        Ok(timeout)
    }

    fn stream_listener(&self, session: &ActiveSession, command_id: &str) -> OutputListener {
        let hub = self.hub.clone();
        let session_id = session.metadata.session_id;
        let command_id = command_id.to_string();
        Box::new(move |stream, bytes| {
            let data = String::from_utf8_lossy(bytes).into_owned();
            let command_id = command_id.clone();
            let frame = match stream {
                OutputStream::Stdout => StreamFrame::Stdout { command_id, data },
                OutputStream::Stderr => StreamFrame::Stderr { command_id, data },
            };
            hub.publish(session_id, frame);
        })
    }

    fn authenticate(&self, token: &str) -> Result<SessionKey, ProxyError> {
        self.tokens
            .validate(token)
            .ok_or(ProxyError::Session(SessionError::InvalidToken))
    }

    async fn check_owner(&self, key: &SessionKey, transfer_id: &str) -> Result<(), ProxyError> {
        let record = self.transfers.transfer_status(transfer_id).await?;
        ensure_owner(key, &record)
    }

    async fn record<T>(
        &self,
        user_id: Uuid,
        action: &str,
        resource_id: Option<Uuid>,
        details: String,
        result: &Result<T, ProxyError>,
    ) {
        let event = match result {
            Ok(_) => LogEvent::success(user_id, action, resource_id, details),
            Err(e) => LogEvent::failure(user_id, action, resource_id, details, e.to_string()),
        };
        self.activity.receive_log_event(event).await;
    }
}

fn ensure_owner(key: &SessionKey, record: &FileTransferRecord) -> Result<(), ProxyError> {
    if record.owner_user_id != key.user_id || record.resource_id != key.resource_id {
        return Err(ProxyError::Forbidden);
    }
    Ok(())
}
