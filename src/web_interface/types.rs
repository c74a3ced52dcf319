use crate::remote::remote_session::{ConnectionDetails, RemoteAuth};
use crate::session_management::session::SessionMetadata;
use crate::session_management::session_registry::SessionCredentials;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SESSION_ACTIVE: &str = "ACTIVE";
pub const DEFAULT_RESOURCE_TYPE: &str = "SSH";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

/// Body of `POST /api/sessions`. Exactly one of `password` and `privateKey` must be set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionRequest {
    pub resource_id: Uuid,
    pub resource_type: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl InitSessionRequest {
    pub fn into_credentials(self) -> Result<SessionCredentials, String> {
        if self.host.trim().is_empty() {
            return Err("host is empty".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("username is empty".to_string());
        }
        let auth = match (self.password, self.private_key) {
            (Some(password), None) => RemoteAuth::Password(password),
            (None, Some(key_pem)) => RemoteAuth::PrivateKey {
                key_pem,
                passphrase: self.passphrase,
            },
            (Some(_), Some(_)) => {
                return Err("password and privateKey are mutually exclusive".to_string())
            }
            (None, None) => return Err("one of password or privateKey is required".to_string()),
        };
        Ok(SessionCredentials {
            resource_id: self.resource_id,
            resource_type: self
                .resource_type
                .unwrap_or_else(|| DEFAULT_RESOURCE_TYPE.to_string()),
            connection: ConnectionDetails {
                host: self.host,
                port: self.port.unwrap_or(DEFAULT_SSH_PORT),
                username: self.username,
                auth,
            },
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_token: String,
    pub session_id: Uuid,
    pub status: &'static str,
    pub expires_at: String,
    pub hosting_instance_id: String,
}

impl From<SessionMetadata> for SessionResponse {
    fn from(metadata: SessionMetadata) -> Self {
        Self {
            session_token: metadata.token,
            session_id: metadata.session_id,
            status: SESSION_ACTIVE,
            expires_at: iso8601(metadata.expires_at),
            hosting_instance_id: metadata.hosting_instance_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveResponse {
    pub status: &'static str,
    pub expires_at: String,
}

impl From<&SessionMetadata> for KeepAliveResponse {
    fn from(metadata: &SessionMetadata) -> Self {
        Self {
            status: SESSION_ACTIVE,
            expires_at: iso8601(metadata.expires_at),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    pub timeout_ms: Option<u64>,
}

/// Text frame a client sends on the streaming socket to start a command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub command: String,
    pub timeout_ms: Option<u64>,
    pub command_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub path: String,
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
