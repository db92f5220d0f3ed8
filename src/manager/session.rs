//! Per-chat session state.

use crate::db::{PoolEntry, SessionExecutor};
use crate::models::{ConnectionConfig, ConnectionStatus, DatabaseType};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// The live part of a session: who connected, to what, over which pool.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub user_id: String,
    /// Latest stream that connected the chat
    pub stream_id: String,
    pub config: ConnectionConfig,
    pub pool: Arc<PoolEntry>,
}

impl SessionBinding {
    pub fn fingerprint(&self) -> &str {
        self.pool.fingerprint()
    }
}

/// One chat's session. Without a binding it is a placeholder that only
/// remembers subscribers.
pub struct Session {
    chat_id: String,
    binding: Option<SessionBinding>,
    status: Mutex<ConnectionStatus>,
    subscribers: Mutex<BTreeSet<String>>,
    last_used: Mutex<Instant>,
    schema_stop: watch::Sender<bool>,
}

impl Session {
    pub fn placeholder(chat_id: impl Into<String>, subscribers: BTreeSet<String>) -> Self {
        Self::build(chat_id.into(), None, ConnectionStatus::Disconnected, subscribers)
    }

    pub fn connected(
        chat_id: impl Into<String>,
        binding: SessionBinding,
        subscribers: BTreeSet<String>,
    ) -> Self {
        Self::build(
            chat_id.into(),
            Some(binding),
            ConnectionStatus::Connected,
            subscribers,
        )
    }

    fn build(
        chat_id: String,
        binding: Option<SessionBinding>,
        status: ConnectionStatus,
        subscribers: BTreeSet<String>,
    ) -> Self {
        let (schema_stop, _) = watch::channel(false);
        Self {
            chat_id,
            binding,
            status: Mutex::new(status),
            subscribers: Mutex::new(subscribers),
            last_used: Mutex::new(Instant::now()),
            schema_stop,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.binding.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Error)
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    /// Snapshot of the subscriber set, sorted.
    pub fn subscribers(&self) -> Vec<String> {
        self.subscribers
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_set(&self) -> BTreeSet<String> {
        self.subscribers
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn add_subscriber(&self, stream_id: &str) -> bool {
        self.subscribers
            .lock()
            .map(|mut s| s.insert(stream_id.to_string()))
            .unwrap_or(false)
    }

    pub fn remove_subscriber(&self, stream_id: &str) -> bool {
        self.subscribers
            .lock()
            .map(|mut s| s.remove(stream_id))
            .unwrap_or(false)
    }

    pub fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Receiver that flips to `true` when schema tracking must stop.
    pub fn schema_stop_signal(&self) -> watch::Receiver<bool> {
        self.schema_stop.subscribe()
    }

    pub fn stop_schema_tracking(&self) {
        self.schema_stop.send_replace(true);
    }

    pub fn executor(&self) -> Option<SessionExecutor> {
        self.binding.as_ref().map(|b| {
            SessionExecutor::new(
                self.chat_id.clone(),
                b.pool.driver().clone(),
                b.pool.handle().clone(),
            )
        })
    }

    pub fn summary(&self) -> SessionSummary {
        let binding = self.binding.as_ref();
        SessionSummary {
            chat_id: self.chat_id.clone(),
            status: self.status(),
            user_id: binding.map(|b| b.user_id.clone()),
            stream_id: binding.map(|b| b.stream_id.clone()),
            database_type: binding.map(|b| b.config.db_type),
            target: binding.map(|b| b.config.masked()),
            fingerprint: binding.map(|b| b.fingerprint().to_string()),
            subscribers: self.subscribers(),
            idle_ms: self.idle_for().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chat_id", &self.chat_id)
            .field("status", &self.status())
            .field("live", &self.is_live())
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

/// Display-safe view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub chat_id: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_type: Option<DatabaseType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub subscribers: Vec<String>,
    pub idle_ms: u64,
}
