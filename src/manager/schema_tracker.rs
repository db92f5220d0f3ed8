//! Per-session schema drift tracking.

use super::{Manager, ManagerInner, supervise};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

impl Manager {
    /// Start the tracking loop for a freshly connected chat.
    pub(super) fn spawn_schema_tracker(&self, chat_id: &str, session_stop: watch::Receiver<bool>) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        let max_restarts = self.inner.config.max_loop_restarts;
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            supervise("schema", max_restarts, move || {
                track_schema(
                    weak.clone(),
                    chat_id.clone(),
                    session_stop.clone(),
                    shutdown.clone(),
                )
            })
            .await;
        });
    }

    /// One extra check after a schema-mutating statement commits.
    pub(super) fn schedule_schema_recheck(&self, chat_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.schema_recheck_delay;
        let chat_id = chat_id.to_string();
        debug!(chat_id = %chat_id, delay_ms = delay.as_millis() as u64, "Schema re-check scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.refresh_schema(&chat_id).await;
            }
        });
    }
}

impl ManagerInner {
    /// Ask the schema service for drift and push any change to subscribers.
    pub(crate) async fn refresh_schema(&self, chat_id: &str) {
        let session = self.sessions.read().await.get(chat_id).cloned();
        let Some(session) = session else {
            return;
        };
        let (Some(executor), Some(binding)) = (session.executor(), session.binding()) else {
            return;
        };

        let selected = self.stream.selected_collections(chat_id).await;
        match self
            .schema
            .check_schema_changes(chat_id, &executor, binding.config.db_type, &selected)
            .await
        {
            Ok((diff, true)) => {
                for stream_id in session.subscribers() {
                    self.stream
                        .handle_schema_change(&binding.user_id, chat_id, &stream_id, diff.clone())
                        .await;
                }
            }
            Ok((_, false)) => debug!(chat_id = %chat_id, "Schema unchanged"),
            Err(err) if err.is_benign() => debug!(chat_id = %chat_id, reason = %err, "Schema check skipped"),
            Err(err) => warn!(chat_id = %chat_id, error = %err, "Schema check failed"),
        }
    }
}

/// Settle, check once if nothing is cached, then check on every interval
/// until the session or the manager stops.
async fn track_schema(
    inner: Weak<ManagerInner>,
    chat_id: String,
    mut session_stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some((settle, interval)) = inner
        .upgrade()
        .map(|i| (i.config.schema_settle_delay, i.config.schema_check_interval))
    else {
        return;
    };
    if *session_stop.borrow() || *shutdown.borrow() {
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(settle) => {}
        _ = session_stop.changed() => return,
        _ = shutdown.changed() => return,
    }

    if let Some(inner) = inner.upgrade()
        && inner.schema.cached_schema(&chat_id).await.is_none()
    {
        inner.refresh_schema(&chat_id).await;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.refresh_schema(&chat_id).await;
            }
            _ = session_stop.changed() => break,
            _ = shutdown.changed() => break,
        }
    }
    debug!(chat_id = %chat_id, "Schema tracking stopped");
}
