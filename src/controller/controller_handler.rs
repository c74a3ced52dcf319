use crate::activity_log::log_batcher::ActivityLogBatcher;
use crate::configuration::config::Config;
use crate::controller::background_task::BackgroundTask;
use crate::controller::output_hub::OutputHub;
use crate::controller::proxy_service::{CommandLimits, ProxyComponents, ProxyService};
use crate::error_handling::types::*;
use crate::remote::command_executor::RemoteCommandExecutor;
use crate::remote::host_key_verifier::{HostKeyPolicy, HostKeyVerifier};
use crate::remote::remote_session::RemoteConnector;
use crate::remote::ssh_client::SshConnector;
use crate::remote::worker_pool::RemoteWorkerPool;
use crate::resilience::breaker_registry::CircuitBreakerRegistry;
use crate::session_management::session_registry::{RegistrySettings, SessionRegistry};
use crate::session_management::token_service::SessionTokenService;
use crate::storage::open_repositories;
use crate::transfer::chunk_store::ChunkStore;
use crate::transfer::cleanup_scheduler::TransferCleanupScheduler;
use crate::transfer::transfer_manager::{ChunkedTransferManager, TransferLimits};
use crate::web_interface::web_server::WebServer;
use chrono::Utc;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Frames buffered per streaming topic before slow subscribers start lagging.
const STREAM_BUFFER: usize = 256;

/// Owns the wiring of the process: builds every component from the configuration, runs the
/// background tasks and the web server, and shuts everything down in order.
pub struct Controller {
    config: Config,
    bind_address: SocketAddr,
    service: Arc<ProxyService>,
    scheduler: Arc<TransferCleanupScheduler>,
    activity: Arc<ActivityLogBatcher>,
}

impl Controller {
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Building components");
        let bind_address = config.bind_address()?;

        // Without a signing key no token could ever be trusted: this is fatal.
        let secret = config
            .token
            .secret
            .as_deref()
            .ok_or(ConfigError::MissingSecret)?;
        let tokens = Arc::new(SessionTokenService::new(secret.as_bytes())?);

        let repositories = open_repositories(&config.storage).await?;

        let policy = HostKeyPolicy::from_config(&config.session.host_key_policy);
        let verifier = match &config.session.known_hosts_path {
            Some(path) => HostKeyVerifier::with_store(policy, path.clone()).map_err(|e| {
                ControllerError::Initialization(format!(
                    "unable to load known hosts from {}: {}",
                    path.display(),
                    e
                ))
            })?,
            None => HostKeyVerifier::new(policy),
        };
        let verifier = Arc::new(verifier);
        info!("Host key policy: {:?}", verifier.policy());

        let pool = Arc::new(RemoteWorkerPool::new(config.workers.max_remote_workers));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.failure_threshold,
            config.breaker_reset_timeout(),
        ));
        let connector: Arc<dyn RemoteConnector> = Arc::new(SshConnector::new(
            Duration::from_secs(config.session.connect_timeout_secs),
            Duration::from_millis(config.command.max_timeout_ms),
        ));
        let registry = Arc::new(SessionRegistry::new(
            tokens.clone(),
            connector,
            verifier.clone(),
            pool.clone(),
            RegistrySettings {
                idle_timeout: config.idle_timeout(),
                token_ttl: config.token_ttl(),
                instance_id: config.instance_id(),
                max_sessions: config.session.max_sessions,
            },
        ));
        info!("Instance id: {}", registry.instance_id());

        let store = Arc::new(ChunkStore::new(config.transfer.scratch_dir.clone()));
        store.ensure_root().await.map_err(|e| {
            ControllerError::Initialization(format!(
                "unable to create scratch directory {}: {}",
                store.root().display(),
                e
            ))
        })?;
        let transfers = Arc::new(
            ChunkedTransferManager::new(
                repositories.transfers.clone(),
                store,
                breakers.clone(),
                pool.clone(),
                TransferLimits {
                    default_chunk_size: config.transfer.chunk_size,
                    max_chunk_size: config.transfer.max_chunk_size,
                },
            )
            .map_err(|e| ControllerError::Initialization(e.to_string()))?,
        );
        let scheduler = Arc::new(TransferCleanupScheduler::new(
            repositories.transfers.clone(),
            transfers.clone(),
            config.retention(),
            config.stalled_threshold(),
        ));
        let activity = Arc::new(ActivityLogBatcher::new(
            repositories.activity.clone(),
            config.activity_log.batch_size,
        ));

        let service = Arc::new(ProxyService::new(ProxyComponents {
            tokens,
            registry,
            executor: Arc::new(RemoteCommandExecutor::new(breakers.clone(), pool)),
            transfers,
            verifier,
            breakers,
            activity: activity.clone(),
            hub: Arc::new(OutputHub::new(STREAM_BUFFER)),
            commands: CommandLimits {
                default_timeout: Duration::from_millis(config.command.default_timeout_ms),
                max_timeout: Duration::from_millis(config.command.max_timeout_ms),
            },
        }));

        Ok(Self {
            config,
            bind_address,
            service,
            scheduler,
            activity,
        })
    }

    pub fn service(&self) -> Arc<ProxyService> {
        self.service.clone()
    }

    /// Serves until Ctrl-C, then stops the background tasks, flushes the activity log and
    /// releases every live session.
    pub async fn run(self) -> Result<(), ControllerError> {
        let tasks = self.start_background_tasks();
        let server = WebServer::new(self.service.clone(), self.config.transfer.max_chunk_size);
        let outcome = server.start(self.bind_address, shutdown_signal()).await;

        info!("Shutting down");
        for task in tasks {
            task.stop().await;
        }
        self.service.shutdown().await;
        outcome.map_err(ControllerError::from)
    }

    fn start_background_tasks(&self) -> Vec<BackgroundTask> {
        let service = self.service.clone();
        let reaper = BackgroundTask::spawn(
            "session-reaper",
            Duration::from_secs(self.config.session.reaper_interval_secs),
            Duration::from_secs(self.config.session.reaper_interval_secs),
            move || {
                let service = service.clone();
                async move {
                    service.reap_sessions().await;
                }
            },
        );

        let activity = self.activity.clone();
        let flush_interval = Duration::from_secs(self.config.activity_log.flush_interval_secs);
        let log_flush = BackgroundTask::spawn(
            "activity-log-flush",
            flush_interval,
            flush_interval,
            move || {
                let activity = activity.clone();
                async move {
                    activity.scheduled_flush().await;
                }
            },
        );

        let scheduler = self.scheduler.clone();
        let stale_sweep = BackgroundTask::spawn(
            "stale-transfer-sweep",
            Duration::from_secs(self.config.transfer.stale_sweep_interval_secs),
            Duration::from_secs(60),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.sweep_stale_artifacts(Utc::now()).await {
                        error!("Stale transfer sweep aborted: {}", e);
                    }
                }
            },
        );

        let scheduler = self.scheduler.clone();
        let stalled_sweep = BackgroundTask::spawn(
            "stalled-transfer-sweep",
            Duration::from_secs(self.config.transfer.stalled_sweep_interval_secs),
            Duration::from_secs(120),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.sweep_stalled_transfers(Utc::now()).await {
                        error!("Stalled transfer sweep aborted: {}", e);
                    }
                }
            },
        );

        vec![reaper, log_flush, stale_sweep, stalled_sweep]
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
