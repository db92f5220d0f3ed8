//! Notification payloads pushed to subscribers.

use crate::models::ConnectionStatus;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Connection status change for one subscriber stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub user_id: String,
    pub chat_id: String,
    pub stream_id: String,
    pub status: ConnectionStatus,
    /// RFC 3339, UTC
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionEvent {
    pub fn new(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        stream_id: impl Into<String>,
        status: ConnectionStatus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            stream_id: stream_id.into(),
            status,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Same event addressed to another subscriber.
    pub fn for_stream(&self, stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            ..self.clone()
        }
    }
}
