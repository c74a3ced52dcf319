use crate::remote::remote_session::RemoteSession;
use crate::session_management::session::{SessionKey, SessionMetadata};
use std::sync::Arc;

/// A resolved, live session: who owns it, its bookkeeping, and the connection it wraps.
#[derive(Clone)]
pub struct ActiveSession {
    pub key: SessionKey,
    pub metadata: SessionMetadata,
    pub connection: Arc<dyn RemoteSession>,
}

impl ActiveSession {
    pub fn host(&self) -> &str {
        &self.metadata.host
    }
}
