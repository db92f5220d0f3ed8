//! Session orchestration.
//!
//! The [`Manager`] is the single entry point. It owns the session map (by
//! chat id), the pool registry (by fingerprint), the execution tracker and
//! the background loops that evict idle resources and watch schemas.
//!
//! Locks are never nested: the session map, the pool registry and the
//! tracker are each taken on their own, and subscriber sets are snapshotted
//! before any notification is dispatched. Connection events go through a
//! single dispatcher task, so subscribers see them in the order they were
//! raised.

mod eviction;
mod execution;
mod schema_tracker;
mod session;

pub use eviction::{EvictionReport, supervise};
pub use execution::{ExecutionGuard, ExecutionTracker};
pub use session::{Session, SessionBinding, SessionSummary};

use crate::config::ManagerConfig;
use crate::db::{Driver, DriverRegistry, PoolEntry, SessionExecutor};
use crate::error::{DbError, DbResult};
use crate::liveness::{InMemoryLivenessStore, LivenessStore, connection_key};
use crate::models::{
    ConnectionConfig, ConnectionEvent, ConnectionInfo, ConnectionStatus, ExecutionSummary,
};
use crate::schema::{DefaultSchemaService, SchemaService};
use crate::stream::{BroadcastStreamHandler, StreamHandler};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct ManagerInner {
    config: ManagerConfig,
    drivers: DriverRegistry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    executions: Arc<ExecutionTracker>,
    schema: Arc<dyn SchemaService>,
    stream: Arc<dyn StreamHandler>,
    liveness: Arc<dyn LivenessStore>,
    shutdown: watch::Sender<bool>,
    eviction: std::sync::Mutex<Option<JoinHandle<()>>>,
    notifier: std::sync::Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

struct Notification {
    chat_id: String,
    user_id: String,
    streams: Vec<String>,
    event: ConnectionEvent,
}

/// Chat-scoped connection manager. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        drivers: DriverRegistry,
        schema: Arc<dyn SchemaService>,
        stream: Arc<dyn StreamHandler>,
        liveness: Arc<dyn LivenessStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                drivers,
                sessions: RwLock::new(HashMap::new()),
                pools: RwLock::new(HashMap::new()),
                executions: Arc::new(ExecutionTracker::new()),
                schema,
                stream,
                liveness,
                shutdown,
                eviction: std::sync::Mutex::new(None),
                notifier: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Manager with the built-in drivers and in-process collaborators.
    pub fn with_defaults(
        config: ManagerConfig,
        row_limit: u32,
        stream: Arc<BroadcastStreamHandler>,
    ) -> Self {
        Self::new(
            config,
            DriverRegistry::with_defaults(row_limit),
            Arc::new(DefaultSchemaService::with_defaults()),
            stream,
            Arc::new(InMemoryLivenessStore::new()),
        )
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Start the supervised eviction loop.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        let max_restarts = self.inner.config.max_loop_restarts;
        let handle = tokio::spawn(async move {
            supervise("eviction", max_restarts, move || {
                eviction::eviction_loop(weak.clone(), shutdown.clone())
            })
            .await;
        });

        if let Ok(mut slot) = self.inner.eviction.lock()
            && let Some(previous) = slot.replace(handle)
        {
            previous.abort();
        }
        info!(
            cleanup_interval_secs = self.inner.config.cleanup_interval.as_secs(),
            idle_timeout_secs = self.inner.config.idle_timeout.as_secs(),
            "Manager started"
        );
    }

    /// Bind a chat to a backend, sharing an existing pool when one matches.
    pub async fn connect(
        &self,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        config: ConnectionConfig,
    ) -> DbResult<ConnectionInfo> {
        if chat_id.is_empty() {
            return Err(DbError::invalid_input("chat_id must not be empty"));
        }
        config.validate()?;

        if self
            .inner
            .sessions
            .read()
            .await
            .get(chat_id)
            .is_some_and(|s| s.is_live() && s.status() == ConnectionStatus::Connected)
        {
            return Err(DbError::connection_exists(chat_id));
        }

        let driver = self.inner.drivers.get(config.db_type)?;
        let (pool, shared) = match self.resolve_pool(&config, &driver).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(chat_id = %chat_id, target = %config.masked(), error = %err, "Connect failed");
                let mut streams = self.subscribers(chat_id).await;
                if !streams.iter().any(|s| s == stream_id) {
                    streams.push(stream_id.to_string());
                }
                self.notify(
                    chat_id,
                    user_id,
                    streams,
                    ConnectionStatus::Error,
                    Some(err.to_string()),
                );
                return Err(err);
            }
        };

        let binding = SessionBinding {
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            config: config.clone(),
            pool: pool.clone(),
        };

        let mut sessions = self.inner.sessions.write().await;
        let previous = sessions.get(chat_id).cloned();
        if previous
            .as_ref()
            .is_some_and(|s| s.is_live() && s.status() == ConnectionStatus::Connected)
        {
            drop(sessions);
            pool.release();
            return Err(DbError::connection_exists(chat_id));
        }

        let mut subscribers = previous
            .as_ref()
            .map(|s| s.subscriber_set())
            .unwrap_or_default();
        subscribers.insert(stream_id.to_string());

        let session = Arc::new(Session::connected(chat_id, binding, subscribers));
        let schema_stop = session.schema_stop_signal();
        sessions.insert(chat_id.to_string(), session.clone());
        drop(sessions);

        // An errored session still held its pool reference.
        if let Some(stale) = previous.as_ref().and_then(|s| s.binding()) {
            stale.pool.release();
            stale.pool.touch();
        }
        if let Some(previous) = &previous {
            previous.stop_schema_tracking();
        }

        self.inner
            .liveness
            .set(&connection_key(chat_id), user_id, self.inner.config.idle_timeout)
            .await;

        info!(
            chat_id = %chat_id,
            db_type = %config.db_type,
            target = %config.masked(),
            shared_pool = shared,
            ref_count = pool.ref_count(),
            "Chat connected"
        );

        let subscribers = session.subscribers();
        self.notify(
            chat_id,
            user_id,
            subscribers.clone(),
            ConnectionStatus::Connected,
            None,
        );
        self.spawn_schema_tracker(chat_id, schema_stop);

        Ok(ConnectionInfo {
            chat_id: chat_id.to_string(),
            database_type: config.db_type,
            database: config.database.clone(),
            target: config.masked(),
            fingerprint: pool.fingerprint().to_string(),
            shared_pool: shared,
            subscribers,
        })
    }

    /// Find or open the pool for `config` and take a reference on it.
    async fn resolve_pool(
        &self,
        config: &ConnectionConfig,
        driver: &Arc<dyn Driver>,
    ) -> DbResult<(Arc<PoolEntry>, bool)> {
        let fingerprint = config.fingerprint();

        if let Some(entry) = self.inner.pools.read().await.get(&fingerprint) {
            check_identity(entry, config)?;
            entry.acquire();
            entry.touch();
            debug!(fingerprint = %fingerprint, ref_count = entry.ref_count(), "Reusing pool");
            return Ok((entry.clone(), true));
        }

        let handle = driver.connect(config).await?;

        let mut pools = self.inner.pools.write().await;
        if let Some(entry) = pools.get(&fingerprint).cloned() {
            // Referenced before the lock drops, so eviction cannot take it.
            let adopted = check_identity(&entry, config).map(|_| {
                entry.acquire();
                entry.touch();
            });
            drop(pools);
            if let Err(err) = driver.disconnect(&handle).await {
                warn!(error = %err, "Failed to close redundant connection");
            }
            adopted?;
            debug!(fingerprint = %fingerprint, "Adopted concurrently opened pool");
            return Ok((entry, true));
        }

        let entry = Arc::new(PoolEntry::new(
            fingerprint.clone(),
            config.clone(),
            handle,
            driver.clone(),
        ));
        pools.insert(fingerprint, entry.clone());
        Ok((entry, false))
    }

    /// Drop the live binding of a chat. Subscribers stay registered.
    pub async fn disconnect(&self, chat_id: &str, user_id: &str, delete_schema: bool) -> DbResult<()> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get(chat_id)
            .filter(|s| s.is_live())
            .cloned()
            .ok_or_else(|| DbError::connection_not_found(chat_id))?;
        let Some(binding) = session.binding().cloned() else {
            return Err(DbError::connection_not_found(chat_id));
        };
        if binding.user_id != user_id {
            return Err(DbError::permission(
                "disconnect",
                format!("chat '{}' belongs to another user", chat_id),
            ));
        }

        let subscribers = session.subscriber_set();
        sessions.insert(
            chat_id.to_string(),
            Arc::new(Session::placeholder(chat_id, subscribers.clone())),
        );
        drop(sessions);

        let remaining = binding.pool.release();
        binding.pool.touch();
        session.stop_schema_tracking();
        self.inner.liveness.remove(&connection_key(chat_id)).await;
        if delete_schema {
            self.inner.schema.clear_cache(chat_id).await;
        }

        info!(chat_id = %chat_id, ref_count = remaining, "Chat disconnected");
        self.notify(
            chat_id,
            &binding.user_id,
            subscribers.into_iter().collect(),
            ConnectionStatus::Disconnected,
            None,
        );
        Ok(())
    }

    /// Executor bound to the chat's live session. Refreshes every idle clock.
    pub async fn get_connection(&self, chat_id: &str) -> DbResult<SessionExecutor> {
        let executor = {
            let sessions = self.inner.sessions.read().await;
            let session = sessions
                .get(chat_id)
                .ok_or_else(|| DbError::connection_not_found(chat_id))?;
            let binding = session
                .binding()
                .ok_or_else(|| DbError::connection_not_found(chat_id))?;
            session.touch();
            binding.pool.touch();
            session.executor()
        };
        let executor = executor.ok_or_else(|| DbError::connection_not_found(chat_id))?;

        self.inner
            .liveness
            .touch(&connection_key(chat_id), self.inner.config.idle_timeout)
            .await;
        Ok(executor)
    }

    /// Register a stream for a chat's events. Creates a placeholder session
    /// when the chat has none yet.
    pub async fn subscribe(&self, chat_id: &str, stream_id: &str) -> DbResult<()> {
        if chat_id.is_empty() || stream_id.is_empty() {
            return Err(DbError::invalid_input("chat_id and stream_id must not be empty"));
        }
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Session::placeholder(chat_id, BTreeSet::new())));
        if session.add_subscriber(stream_id) {
            debug!(chat_id = %chat_id, stream_id = %stream_id, "Stream subscribed");
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, chat_id: &str, stream_id: &str) {
        if let Some(session) = self.inner.sessions.read().await.get(chat_id)
            && session.remove_subscriber(stream_id)
        {
            debug!(chat_id = %chat_id, stream_id = %stream_id, "Stream unsubscribed");
        }
    }

    /// Ping the chat's backend. A failed ping marks the session as errored
    /// and notifies subscribers.
    pub async fn is_connected(&self, chat_id: &str) -> bool {
        let session = self.inner.sessions.read().await.get(chat_id).cloned();
        let Some(session) = session else {
            return false;
        };
        let (Some(executor), Some(binding)) = (session.executor(), session.binding()) else {
            return false;
        };

        let failure = match tokio::time::timeout(self.inner.config.ping_timeout, executor.ping()).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!(
                "Ping timed out after {}ms",
                self.inner.config.ping_timeout.as_millis()
            )),
        };

        match failure {
            None => {
                if session.status() != ConnectionStatus::Connected {
                    session.set_status(ConnectionStatus::Connected);
                }
                true
            }
            Some(message) => {
                warn!(chat_id = %chat_id, error = %message, "Liveness check failed");
                if session.status() != ConnectionStatus::Error {
                    session.set_status(ConnectionStatus::Error);
                    self.notify(
                        chat_id,
                        &binding.user_id,
                        session.subscribers(),
                        ConnectionStatus::Error,
                        Some(message),
                    );
                }
                false
            }
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        summaries
    }

    pub async fn session_status(&self, chat_id: &str) -> Option<ConnectionStatus> {
        self.inner
            .sessions
            .read()
            .await
            .get(chat_id)
            .map(|s| s.status())
    }

    pub async fn subscribers(&self, chat_id: &str) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .await
            .get(chat_id)
            .map(|s| s.subscribers())
            .unwrap_or_default()
    }

    pub async fn pool_ref_count(&self, fingerprint: &str) -> Option<usize> {
        self.inner
            .pools
            .read()
            .await
            .get(fingerprint)
            .map(|p| p.ref_count())
    }

    pub async fn pool_count(&self) -> usize {
        self.inner.pools.read().await.len()
    }

    pub fn active_executions(&self) -> Vec<ExecutionSummary> {
        self.inner.executions.summaries()
    }

    pub fn is_executing(&self, stream_id: &str) -> bool {
        self.inner.executions.is_executing(stream_id)
    }

    /// Run one eviction pass now.
    pub async fn evict_idle(&self) -> EvictionReport {
        self.inner.run_eviction_cycle().await
    }

    /// Cancel executions, drop every session and close every pool once.
    ///
    /// Each phase is bounded: cancelled executions get twice
    /// `rollback_timeout` to return, parked rollbacks one more
    /// `rollback_timeout`, and every pool `close_timeout`. Statements the
    /// backend cannot interrupt keep running server-side until they finish.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        if let Ok(mut slot) = self.inner.eviction.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }

        let executions = &self.inner.executions;
        let cancelled = executions.cancel_all();
        let grace = self.inner.config.rollback_timeout;
        if !executions.wait_idle(grace * 2).await {
            warn!(executions = executions.live(), "Executions still running at shutdown");
        }
        let aborted = executions.drain_parked(grace).await;
        if aborted > 0 {
            warn!(rollbacks = aborted, "Abandoned pending rollbacks at shutdown");
        }

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &sessions {
            session.stop_schema_tracking();
            if session.is_live() {
                self.inner
                    .liveness
                    .remove(&connection_key(session.chat_id()))
                    .await;
            }
        }

        let pools: Vec<Arc<PoolEntry>> = self
            .inner
            .pools
            .write()
            .await
            .drain()
            .map(|(_, p)| p)
            .collect();
        let closed = self.inner.close_pools(&pools).await;

        info!(
            executions = cancelled,
            sessions = sessions.len(),
            pools = pools.len(),
            closed,
            "Manager stopped"
        );
    }

    /// Queue a status change for `streams` without blocking the caller.
    fn notify(
        &self,
        chat_id: &str,
        user_id: &str,
        streams: Vec<String>,
        status: ConnectionStatus,
        error: Option<String>,
    ) {
        if streams.is_empty() {
            return;
        }
        let mut event = ConnectionEvent::new(user_id, chat_id, "", status);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        let notification = Notification {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            streams,
            event,
        };

        let Ok(mut slot) = self.inner.notifier.lock() else {
            warn!(chat_id = %chat_id, "Notifier lock poisoned, event dropped");
            return;
        };
        let sender = slot.get_or_insert_with(|| dispatcher(self.inner.stream.clone()));
        // A dispatcher that died with a panicking handler is replaced once.
        if let Err(mpsc::error::SendError(notification)) = sender.send(notification) {
            debug!(chat_id = %chat_id, "Restarting event dispatcher");
            let sender = slot.insert(dispatcher(self.inner.stream.clone()));
            if sender.send(notification).is_err() {
                warn!(chat_id = %chat_id, "Event dispatcher unavailable, event dropped");
            }
        }
    }
}

/// Deliver queued notifications one at a time, in queue order. Ends when
/// the manager drops its sender.
fn dispatcher(handler: Arc<dyn StreamHandler>) -> mpsc::UnboundedSender<Notification> {
    let (sender, mut queue) = mpsc::unbounded_channel::<Notification>();
    tokio::spawn(async move {
        while let Some(n) = queue.recv().await {
            for stream_id in &n.streams {
                handler
                    .handle_db_event(&n.user_id, &n.chat_id, stream_id, n.event.for_stream(stream_id))
                    .await;
            }
        }
    });
    sender
}

/// A pool hit must name exactly the requested backend identity.
fn check_identity(entry: &PoolEntry, config: &ConnectionConfig) -> DbResult<()> {
    if entry.config().same_identity(config) {
        Ok(())
    } else {
        Err(DbError::connection(
            format!(
                "Pool {} is bound to {} but {} was requested",
                entry.fingerprint(),
                entry.config().masked(),
                config.masked()
            ),
            "Retry the connection; if it persists the pool registry is inconsistent",
        ))
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.inner.config)
            .field("drivers", &self.inner.drivers)
            .finish()
    }
}
