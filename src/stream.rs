//! Push channel towards chat clients.
//!
//! The manager never writes to clients directly. Connection events and
//! schema drift are handed to a [`StreamHandler`], which decides how they
//! reach the stream named by `stream_id`.

use crate::models::{ConnectionEvent, SchemaDiff};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_db_event(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        event: ConnectionEvent,
    );

    async fn handle_schema_change(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        diff: SchemaDiff,
    );

    /// `"ALL"` or a comma-separated list of tracked tables.
    async fn selected_collections(&self, chat_id: &str) -> String;
}

/// Message delivered to broadcast subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    DbEvent {
        user_id: String,
        chat_id: String,
        stream_id: String,
        event: ConnectionEvent,
    },
    SchemaChange {
        user_id: String,
        chat_id: String,
        stream_id: String,
        diff: SchemaDiff,
    },
}

impl StreamMessage {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::DbEvent { stream_id, .. } | Self::SchemaChange { stream_id, .. } => stream_id,
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            Self::DbEvent { chat_id, .. } | Self::SchemaChange { chat_id, .. } => chat_id,
        }
    }
}

/// [`StreamHandler`] backed by a tokio broadcast channel.
///
/// Messages sent while nobody listens are dropped; slow receivers lag.
pub struct BroadcastStreamHandler {
    sender: broadcast::Sender<StreamMessage>,
    selections: RwLock<HashMap<String, String>>,
}

impl BroadcastStreamHandler {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            selections: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.sender.subscribe()
    }

    /// Restrict schema tracking for a chat. `"ALL"` resets it.
    pub fn set_selected_collections(&self, chat_id: &str, selection: impl Into<String>) {
        if let Ok(mut selections) = self.selections.write() {
            selections.insert(chat_id.to_string(), selection.into());
        }
    }

    fn publish(&self, message: StreamMessage) {
        if self.sender.send(message).is_err() {
            trace!("No stream receivers, message dropped");
        }
    }
}

impl Default for BroadcastStreamHandler {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_BUFFER)
    }
}

#[async_trait]
impl StreamHandler for BroadcastStreamHandler {
    async fn handle_db_event(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        event: ConnectionEvent,
    ) {
        self.publish(StreamMessage::DbEvent {
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
            event,
        });
    }

    async fn handle_schema_change(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        diff: SchemaDiff,
    ) {
        self.publish(StreamMessage::SchemaChange {
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
            diff,
        });
    }

    async fn selected_collections(&self, chat_id: &str) -> String {
        self.selections
            .read()
            .ok()
            .and_then(|selections| selections.get(chat_id).cloned())
            .unwrap_or_else(|| "ALL".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionStatus;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let handler = BroadcastStreamHandler::new(8);
        let mut rx = handler.subscribe();

        let event = ConnectionEvent::new("u1", "c1", "s1", ConnectionStatus::Connected);
        handler.handle_db_event("u1", "c1", "s1", event.clone()).await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.stream_id(), "s1");
        assert_eq!(message.chat_id(), "c1");
        match message {
            StreamMessage::DbEvent { event: got, .. } => assert_eq!(got, event),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_receivers_is_silent() {
        let handler = BroadcastStreamHandler::new(1);
        handler
            .handle_schema_change("u1", "c1", "s1", SchemaDiff::default())
            .await;
    }

    #[tokio::test]
    async fn test_selected_collections_default_all() {
        let handler = BroadcastStreamHandler::default();
        assert_eq!(handler.selected_collections("c1").await, "ALL");
        handler.set_selected_collections("c1", "users,orders");
        assert_eq!(handler.selected_collections("c1").await, "users,orders");
        assert_eq!(handler.selected_collections("c2").await, "ALL");
    }

    #[test]
    fn test_message_serialization_tag() {
        let message = StreamMessage::SchemaChange {
            user_id: "u".into(),
            chat_id: "c".into(),
            stream_id: "s".into(),
            diff: SchemaDiff::default(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "schema_change");
        assert_eq!(json["stream_id"], "s");
    }
}
