use crate::error_handling::types::SessionError;
use crate::remote::host_key_verifier::HostKeyVerifier;
use crate::remote::remote_session::{ConnectionDetails, RemoteConnector, RemoteSession};
use crate::remote::worker_pool::RemoteWorkerPool;
use crate::session_management::active_session::ActiveSession;
use crate::session_management::session::{SessionKey, SessionMetadata};
use crate::session_management::token_service::SessionTokenService;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// What a caller hands over to open a session on one resource.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub resource_id: Uuid,
    pub resource_type: String,
    pub connection: ConnectionDetails,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub idle_timeout: Duration,
    pub token_ttl: Duration,
    pub instance_id: String,
    /// Live sessions plus connections being opened may not exceed this.
    pub max_sessions: usize,
}

/// A freshly opened session and, when one existed for the same user and resource, the
/// session it replaced.
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub metadata: SessionMetadata,
    pub replaced: Option<SessionMetadata>,
}

struct SessionEntry {
    key: SessionKey,
    metadata: SessionMetadata,
    connection: Arc<dyn RemoteSession>,
}

#[derive(Default)]
struct SessionTable {
    by_token: HashMap<String, SessionEntry>,
    by_key: HashMap<SessionKey, String>,
}

impl SessionTable {
    fn remove(&mut self, token: &str) -> Option<SessionEntry> {
        let entry = self.by_token.remove(token)?;
        if self.by_key.get(&entry.key).map(String::as_str) == Some(token) {
            self.by_key.remove(&entry.key);
        }
        Some(entry)
    }
}

/// The structure owning the live sessions of this instance
///
/// Sessions are keyed by their token. State is local to the process: in a multi-instance
/// deployment the routing layer sends a session's calls to the instance named in
/// `hosting_instance_id`.
///
/// # Fields Overview
///
/// - `tokens`: mints the token handed back at session init and validates it on every call
/// - `connector`: opens the underlying remote connection
/// - `verifier`: host key trust decisions made while connecting
/// - `pool`: connects and disconnects run there, they block
/// - `table`: token -> session and SessionKey -> token
/// - `opening`: connections being opened, counted against `max_sessions`
/// - `key_locks`: serializes session creation per user and resource
pub struct SessionRegistry {
    tokens: Arc<SessionTokenService>,
    connector: Arc<dyn RemoteConnector>,
    verifier: Arc<HostKeyVerifier>,
    pool: Arc<RemoteWorkerPool>,
    settings: RegistrySettings,
    table: RwLock<SessionTable>,
    opening: AtomicUsize,
    key_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        tokens: Arc<SessionTokenService>,
        connector: Arc<dyn RemoteConnector>,
        verifier: Arc<HostKeyVerifier>,
        pool: Arc<RemoteWorkerPool>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            tokens,
            connector,
            verifier,
            pool,
            settings,
            table: RwLock::new(SessionTable::default()),
            opening: AtomicUsize::new(0),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    /// Opens a connection for `user_id` on the credential's resource and records it.
    ///
    /// A session that already exists for the same user and resource is released first and
    /// returned as `replaced`. Creations for the same key run one at a time.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        credentials: SessionCredentials,
    ) -> Result<OpenedSession, SessionError> {
        let key = SessionKey {
            user_id,
            resource_id: credentials.resource_id,
            resource_type: credentials.resource_type.clone(),
        };
        let key_lock = self.lock_for(&key);
        let result = {
            let _guard = key_lock.lock().await;
            self.open_for_key(key.clone(), credentials).await
        };
        self.forget_lock(&key, key_lock);
        result
    }

    async fn open_for_key(
        &self,
        key: SessionKey,
        credentials: SessionCredentials,
    ) -> Result<OpenedSession, SessionError> {
        let (slot, previous) = {
            let mut table = self.table.write().await;
            let replacing = table.by_key.contains_key(&key);
            let live = table.by_token.len() - usize::from(replacing)
                + self.opening.load(Ordering::Acquire);
            if live >= self.settings.max_sessions {
                warn!(
                    "Refusing session for user {}: {} sessions already live",
                    key.user_id, live
                );
                return Err(SessionError::CapacityExhausted(self.settings.max_sessions));
            }
            let slot = OpeningSlot::claim(&self.opening);
            let token = table.by_key.get(&key).cloned();
            (slot, token.and_then(|token| table.remove(&token)))
        };
        let replaced = match previous {
            Some(previous) => {
                info!(
                    "Releasing previous session {} of user {} on resource {}",
                    previous.metadata.session_id, key.user_id, key.resource_id
                );
                self.close_connection(previous.connection).await;
                Some(previous.metadata)
            }
            None => None,
        };

        let connector = self.connector.clone();
        let verifier = self.verifier.clone();
        let details = credentials.connection.clone();
        let connection = self
            .pool
            .run(move || connector.open(&details, &verifier))
            .await?;

        let token = match self.tokens.generate_token(&key, self.settings.token_ttl) {
            Ok(token) => token,
            Err(e) => {
                self.close_connection(connection).await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let metadata = SessionMetadata {
            session_id: Uuid::new_v4(),
            token: token.clone(),
            created_at: now,
            last_accessed_time: now,
            expires_at: now + to_chrono(self.settings.idle_timeout),
            hosting_instance_id: self.settings.instance_id.clone(),
            host: credentials.connection.host.clone(),
            port: credentials.connection.port,
            username: credentials.connection.username.clone(),
        };

        let mut table = self.table.write().await;
        table.by_key.insert(key.clone(), token.clone());
        table.by_token.insert(
            token,
            SessionEntry {
                key: key.clone(),
                metadata: metadata.clone(),
                connection,
            },
        );
        drop(slot);
        drop(table);
        info!(
            "Session {} opened for user {} on {}@{}",
            metadata.session_id, key.user_id, metadata.username, metadata.host
        );
        Ok(OpenedSession { metadata, replaced })
    }

    /// Pushes the expiry of a live session forward. False when the token is unknown or the
    /// session already expired.
    pub async fn keep_alive(&self, token: &str) -> bool {
        let now = Utc::now();
        let expired = {
            let mut table = self.table.write().await;
            if let Some(entry) = table.by_token.get_mut(token) {
                if !entry.metadata.is_expired_at(now) {
                    entry.metadata.last_accessed_time = now;
                    entry.metadata.expires_at = now + to_chrono(self.settings.idle_timeout);
                    debug!("Session {} kept alive", entry.metadata.session_id);
                    return true;
                }
            }
            table.remove(token)
        };
        if let Some(entry) = expired {
            info!("Session {} expired before keepalive", entry.metadata.session_id);
            self.close_connection(entry.connection).await;
        }
        false
    }

    /// Closes and forgets the session. Unknown tokens are ignored.
    pub async fn release(&self, token: &str) -> Option<SessionMetadata> {
        let entry = self.table.write().await.remove(token)?;
        info!("Session {} released", entry.metadata.session_id);
        self.close_connection(entry.connection).await;
        Some(entry.metadata)
    }

    /// Validates the token and returns the live session it designates.
    pub async fn resolve(&self, token: &str) -> Result<ActiveSession, SessionError> {
        let key = self
            .tokens
            .validate(token)
            .ok_or(SessionError::InvalidToken)?;

        let (expired, disconnected) = {
            let table = self.table.read().await;
            let entry = table.by_token.get(token).ok_or(SessionError::NotFound)?;
            if entry.key != key {
                warn!("Token of session {} does not match its owner", entry.metadata.session_id);
                return Err(SessionError::NotFound);
            }
            let expired = entry.metadata.is_expired_at(Utc::now());
            let disconnected = !entry.connection.is_connected();
            if !expired && !disconnected {
                return Ok(ActiveSession {
                    key: entry.key.clone(),
                    metadata: entry.metadata.clone(),
                    connection: entry.connection.clone(),
                });
            }
            (expired, disconnected)
        };

        self.release(token).await;
        if expired {
            Err(SessionError::Expired)
        } else {
            debug!("Connection dropped: {}", disconnected);
            Err(SessionError::NotFound)
        }
    }

    pub async fn metadata(&self, token: &str) -> Option<SessionMetadata> {
        self.table
            .read()
            .await
            .by_token
            .get(token)
            .map(|entry| entry.metadata.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.table.read().await.by_token.len()
    }

    /// Releases sessions past their expiry or whose connection dropped. Returns what was
    /// released.
    pub async fn reap_expired(&self) -> Vec<SessionMetadata> {
        let now = Utc::now();
        let reaped: Vec<SessionEntry> = {
            let mut table = self.table.write().await;
            let stale: Vec<String> = table
                .by_token
                .iter()
                .filter(|(_, entry)| {
                    entry.metadata.is_expired_at(now) || !entry.connection.is_connected()
                })
                .map(|(token, _)| token.clone())
                .collect();
            stale.iter().filter_map(|token| table.remove(token)).collect()
        };

        let mut released = Vec::with_capacity(reaped.len());
        for entry in reaped {
            info!("Reaping session {}", entry.metadata.session_id);
            self.close_connection(entry.connection).await;
            released.push(entry.metadata);
        }
        if !released.is_empty() {
            info!("Reaped {} expired sessions", released.len());
        }
        released
    }

    pub async fn release_all(&self) -> usize {
        let entries: Vec<SessionEntry> = {
            let mut table = self.table.write().await;
            table.by_key.clear();
            table.by_token.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            self.close_connection(entry.connection).await;
        }
        if count > 0 {
            info!("Released {} sessions", count);
        }
        count
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drops the key's lock once no other creation is waiting on it.
    fn forget_lock(&self, key: &SessionKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Held by the map and by `lock`.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    async fn close_connection(&self, connection: Arc<dyn RemoteSession>) {
        let host = connection.host().to_string();
        let closed = self
            .pool
            .run(move || {
                connection.close();
                Ok(())
            })
            .await;
        if let Err(e) = closed {
            warn!("Failed to close connection to {}: {}", host, e);
        }
    }
}

/// A capacity slot held while a connection is being opened. Released on drop, including when
/// the creating request is cancelled mid-connect.
struct OpeningSlot<'a>(&'a AtomicUsize);

impl<'a> OpeningSlot<'a> {
    fn claim(opening: &'a AtomicUsize) -> Self {
        opening.fetch_add(1, Ordering::AcqRel);
        Self(opening)
    }
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::RemoteError;
    use crate::remote::host_key_verifier::HostKeyPolicy;
    use crate::remote::testing::{details, FakeConnector};

    const SECRET: &[u8] = b"registry-test-secret-0123456789abcdef0123456789";

    fn registry_with(
        connector: Arc<FakeConnector>,
        policy: HostKeyPolicy,
        idle_timeout: Duration,
    ) -> SessionRegistry {
        capped_registry(connector, policy, idle_timeout, 100)
    }

    fn capped_registry(
        connector: Arc<FakeConnector>,
        policy: HostKeyPolicy,
        idle_timeout: Duration,
        max_sessions: usize,
    ) -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(SessionTokenService::new(SECRET).unwrap()),
            connector,
            Arc::new(HostKeyVerifier::new(policy)),
            Arc::new(RemoteWorkerPool::new(4)),
            RegistrySettings {
                idle_timeout,
                token_ttl: Duration::from_secs(3600),
                instance_id: "instance-test".to_string(),
                max_sessions,
            },
        )
    }

    fn credentials(resource_id: Uuid) -> SessionCredentials {
        SessionCredentials {
            resource_id,
            resource_type: "SSH".to_string(),
            connection: details("db01"),
        }
    }

    #[tokio::test]
    async fn test_create_records_metadata() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), HostKeyPolicy::AutoAccept, Duration::from_secs(60));

        let metadata = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;

        assert_eq!(metadata.created_at, metadata.last_accessed_time);
        assert!(metadata.expires_at > metadata.last_accessed_time);
        assert_eq!(metadata.hosting_instance_id, "instance-test");
        assert_eq!(metadata.host, "db01");
        assert_eq!(metadata.username, "deploy");
        assert_eq!(registry.active_count().await, 1);

        let active = registry.resolve(&metadata.token).await.unwrap();
        assert_eq!(active.metadata.session_id, metadata.session_id);
        assert_eq!(active.key.resource_type, "SSH");
    }

    #[tokio::test]
    async fn test_strict_policy_refuses_unknown_host() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), HostKeyPolicy::Strict, Duration::from_secs(60));

        let result = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Remote(RemoteError::HostKeyRejected { .. }))
        ));
        assert_eq!(connector.opened_count(), 0);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_expiry() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector, HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        let metadata = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.keep_alive(&metadata.token).await);

        let refreshed = registry.metadata(&metadata.token).await.unwrap();
        assert!(refreshed.expires_at > metadata.expires_at);
        assert!(refreshed.last_accessed_time > metadata.last_accessed_time);
        assert!(refreshed.expires_at >= refreshed.last_accessed_time);
        assert!(!registry.keep_alive("unknown-token").await);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_kept_alive() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry_with(
            connector.clone(),
            HostKeyPolicy::AutoAccept,
            Duration::from_millis(10),
        );
        let metadata = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!registry.keep_alive(&metadata.token).await);
        assert_eq!(registry.active_count().await, 0);
        assert!(!connector.last().connected.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resolve_reports_expiry() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector, HostKeyPolicy::AutoAccept, Duration::from_millis(10));
        let metadata = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            registry.resolve(&metadata.token).await,
            Err(SessionError::Expired)
        ));
        assert!(matches!(
            registry.resolve(&metadata.token).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resolve_rejects_foreign_tokens() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector, HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        assert!(matches!(
            registry.resolve("garbage").await,
            Err(SessionError::InvalidToken)
        ));

        let other_service = SessionTokenService::new(SECRET).unwrap();
        let orphan = other_service
            .generate_token(
                &SessionKey {
                    user_id: Uuid::new_v4(),
                    resource_id: Uuid::new_v4(),
                    resource_type: "SSH".to_string(),
                },
                Duration::from_secs(60),
            )
            .unwrap();
        assert!(matches!(
            registry.resolve(&orphan).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        let metadata = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;

        assert!(registry.release(&metadata.token).await.is_some());
        assert!(registry.release(&metadata.token).await.is_none());
        assert!(registry.release("never-issued").await.is_none());
        assert!(!connector.last().connected.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_session_for_same_key_replaces_first() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        let user = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let first = registry
            .create_session(user, credentials(resource))
            .await
            .unwrap()
            .metadata;
        let first_connection = connector.last();
        let second = registry
            .create_session(user, credentials(resource))
            .await
            .unwrap()
            .metadata;

        assert_eq!(registry.active_count().await, 1);
        assert!(!first_connection
            .connected
            .load(std::sync::atomic::Ordering::SeqCst));
        assert!(registry.metadata(&first.token).await.is_none());
        assert!(registry.metadata(&second.token).await.is_some());
    }

    #[tokio::test]
    async fn test_replacement_reports_the_released_session() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector, HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        let user = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let first = registry
            .create_session(user, credentials(resource))
            .await
            .unwrap();
        assert!(first.replaced.is_none());

        let second = registry
            .create_session(user, credentials(resource))
            .await
            .unwrap();
        let replaced = second.replaced.unwrap();
        assert_eq!(replaced.session_id, first.metadata.session_id);
        assert_ne!(second.metadata.session_id, first.metadata.session_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_for_same_key_leave_one_session() {
        let connector = Arc::new(FakeConnector::new());
        let registry = Arc::new(registry_with(
            connector.clone(),
            HostKeyPolicy::AutoAccept,
            Duration::from_secs(60),
        ));
        let user = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create_session(user, credentials(resource)).await
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap().metadata.token);
        }

        assert_eq!(registry.active_count().await, 1);
        let live: Vec<_> = connector
            .opened
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.connected.load(std::sync::atomic::Ordering::SeqCst))
            .cloned()
            .collect();
        assert_eq!(live.len(), 1);

        let mut survivors = 0;
        for token in &tokens {
            if registry.metadata(token).await.is_some() {
                survivors += 1;
            }
        }
        assert_eq!(survivors, 1);
    }

    #[tokio::test]
    async fn test_session_cap_refuses_new_keys() {
        let connector = Arc::new(FakeConnector::new());
        let registry = capped_registry(
            connector.clone(),
            HostKeyPolicy::AutoAccept,
            Duration::from_secs(60),
            2,
        );
        let user = Uuid::new_v4();
        let first_resource = Uuid::new_v4();
        registry
            .create_session(user, credentials(first_resource))
            .await
            .unwrap();
        registry
            .create_session(user, credentials(Uuid::new_v4()))
            .await
            .unwrap();

        let refused = registry
            .create_session(user, credentials(Uuid::new_v4()))
            .await;
        assert!(matches!(refused, Err(SessionError::CapacityExhausted(2))));
        assert_eq!(connector.opened_count(), 2);
        assert_eq!(registry.active_count().await, 2);

        // Replacing an existing session does not need a new slot.
        assert!(registry
            .create_session(user, credentials(first_resource))
            .await
            .is_ok());
        assert_eq!(registry.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_connect_gives_its_slot_back() {
        let connector = Arc::new(FakeConnector::new());
        let registry = capped_registry(
            connector.clone(),
            HostKeyPolicy::AutoAccept,
            Duration::from_secs(60),
            1,
        );
        connector
            .refuse
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .is_err());

        connector
            .refuse
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reaper_releases_expired_and_dropped_sessions() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), HostKeyPolicy::AutoAccept, Duration::from_secs(60));
        let kept = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;
        let dropped = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await
            .unwrap()
            .metadata;
        connector.last().close();

        let reaped = registry.reap_expired().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].session_id, dropped.session_id);
        assert!(registry.metadata(&kept.token).await.is_some());
    }

    #[tokio::test]
    async fn test_connection_failure_creates_nothing() {
        let connector = Arc::new(FakeConnector::new());
        connector
            .refuse
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let registry =
            registry_with(connector, HostKeyPolicy::AutoAccept, Duration::from_secs(60));

        let result = registry
            .create_session(Uuid::new_v4(), credentials(Uuid::new_v4()))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Remote(RemoteError::ConnectionFailed { .. }))
        ));
        assert_eq!(registry.active_count().await, 0);
    }
}
