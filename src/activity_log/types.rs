use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogStatus {
    Success,
    Failure,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "SUCCESS",
            LogStatus::Failure => "FAILURE",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(LogStatus::Success),
            "FAILURE" => Ok(LogStatus::Failure),
            other => Err(format!("unknown log status '{}'", other)),
        }
    }
}

/// One finished operation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub user_id: Uuid,
    pub action: String,
    pub resource_id: Option<Uuid>,
    pub details: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn success(
        user_id: Uuid,
        action: &str,
        resource_id: Option<Uuid>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            resource_id,
            details: details.into(),
            status: LogStatus::Success,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        user_id: Uuid,
        action: &str,
        resource_id: Option<Uuid>,
        details: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            resource_id,
            details: details.into(),
            status: LogStatus::Failure,
            error_message: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Action names recorded in the activity log.
pub mod actions {
    pub const SESSION_INIT: &str = "SESSION_INIT";
    pub const SESSION_KEEPALIVE: &str = "SESSION_KEEPALIVE";
    pub const SESSION_RELEASE: &str = "SESSION_RELEASE";
    pub const COMMAND_EXECUTE: &str = "COMMAND_EXECUTE";
    pub const DIRECTORY_LIST: &str = "DIRECTORY_LIST";
    pub const TRANSFER_INIT: &str = "TRANSFER_INIT";
    pub const TRANSFER_CHUNK: &str = "TRANSFER_CHUNK";
    pub const TRANSFER_CANCEL: &str = "TRANSFER_CANCEL";
}
