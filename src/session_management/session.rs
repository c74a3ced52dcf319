use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity bound into a session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub user_id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Topic id for streaming; never the token itself.
    pub session_id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hosting_instance_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SessionMetadata {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
