//! Cancellable, transactional query execution.
//!
//! Every in-flight query is tracked by stream id. The statement runs in its
//! own task inside a transaction and races a deadline and a cancel signal;
//! whichever loses is aborted and the transaction rolled back.
//!
//! Rollbacks are bounded by `rollback_timeout`. A rollback still waiting on
//! its connection when the bound passes is parked on the tracker and keeps
//! running in the background; the caller gets its error right away.

use super::Manager;
use crate::db::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteQueryRequest, ExecutionState, ExecutionSummary, QueryExecutionResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

type SharedTransaction = Arc<tokio::sync::Mutex<Box<dyn Transaction>>>;

struct ExecutionEntry {
    id: u64,
    chat_id: String,
    query_id: String,
    message_id: String,
    started_at: DateTime<Utc>,
    registered: Instant,
    state: ExecutionState,
    cancel: Arc<Notify>,
}

/// Registry of in-flight queries keyed by stream id.
///
/// Cancelled entries leave the map at once, so `live` counts the guards
/// still alive; shutdown waits on it.
pub struct ExecutionTracker {
    entries: Mutex<HashMap<String, ExecutionEntry>>,
    next_id: AtomicU64,
    live: watch::Sender<usize>,
    parked: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            live: watch::Sender::new(0),
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Track a new execution. A stream runs one query at a time.
    pub fn register(self: &Arc<Self>, request: &ExecuteQueryRequest) -> DbResult<ExecutionGuard> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DbError::internal("Execution tracker lock poisoned"))?;

        if entries
            .get(&request.stream_id)
            .is_some_and(|entry| !entry.state.is_terminal())
        {
            return Err(DbError::invalid_input(format!(
                "A query is already executing for stream '{}'",
                request.stream_id
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        entries.insert(
            request.stream_id.clone(),
            ExecutionEntry {
                id,
                chat_id: request.chat_id.clone(),
                query_id: request.query_id.clone(),
                message_id: request.message_id.clone(),
                started_at: Utc::now(),
                registered: Instant::now(),
                state: ExecutionState::Pending,
                cancel: cancel.clone(),
            },
        );

        self.live.send_modify(|n| *n += 1);
        Ok(ExecutionGuard {
            tracker: self.clone(),
            stream_id: request.stream_id.clone(),
            id,
            cancel,
            task: None,
        })
    }

    /// Fire the cancel signal and forget the entry. Unknown streams are
    /// ignored.
    pub fn cancel(&self, stream_id: &str) -> bool {
        let entry = match self.entries.lock() {
            Ok(mut entries) => entries.remove(stream_id),
            Err(_) => None,
        };
        match entry {
            Some(entry) => {
                entry.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ExecutionEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };
        for entry in &drained {
            entry.cancel.notify_one();
        }
        drained.len()
    }

    pub fn is_executing(&self, stream_id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(stream_id)
                    .is_some_and(|e| e.state == ExecutionState::Executing)
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<ExecutionSummary> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut summaries: Vec<_> = entries
            .iter()
            .map(|(stream_id, e)| ExecutionSummary {
                stream_id: stream_id.clone(),
                chat_id: e.chat_id.clone(),
                query_id: e.query_id.clone(),
                message_id: e.message_id.clone(),
                started_at: e.started_at,
                state: e.state,
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    /// Guards not yet dropped, including cancelled executions that are
    /// still rolling back.
    pub fn live(&self) -> usize {
        *self.live.borrow()
    }

    /// Wait until every guard has dropped. Returns false if `bound` passed
    /// first.
    pub async fn wait_idle(&self, bound: Duration) -> bool {
        let mut live = self.live.subscribe();
        let idle = tokio::time::timeout(bound, live.wait_for(|n| *n == 0))
            .await
            .is_ok();
        idle
    }

    fn park(&self, rollback: JoinHandle<()>) {
        if let Ok(mut parked) = self.parked.lock() {
            parked.retain(|h| !h.is_finished());
            parked.push(rollback);
        }
    }

    /// Rollbacks that outlived their bound and have not finished yet.
    pub fn parked_rollbacks(&self) -> usize {
        self.parked
            .lock()
            .map(|parked| parked.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Wait up to `bound` for parked rollbacks, aborting the ones still
    /// running. Returns how many were aborted.
    pub async fn drain_parked(&self, bound: Duration) -> usize {
        let parked: Vec<JoinHandle<()>> = match self.parked.lock() {
            Ok(mut parked) => parked.drain(..).filter(|h| !h.is_finished()).collect(),
            Err(_) => Vec::new(),
        };
        let aborts: Vec<AbortHandle> = parked.iter().map(JoinHandle::abort_handle).collect();
        let _ = tokio::time::timeout(bound, futures_util::future::join_all(parked)).await;

        let mut aborted = 0;
        for handle in aborts {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Drop entries that are not executing and older than `max_age`.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| {
            e.state == ExecutionState::Executing || e.registered.elapsed() <= max_age
        });
        before - entries.len()
    }

    fn set_state(&self, stream_id: &str, id: u64, state: ExecutionState) {
        if let Ok(mut entries) = self.entries.lock()
            && let Some(entry) = entries.get_mut(stream_id)
            && entry.id == id
        {
            entry.state = state;
        }
    }

    fn remove(&self, stream_id: &str, id: u64) {
        if let Ok(mut entries) = self.entries.lock()
            && entries.get(stream_id).is_some_and(|e| e.id == id)
        {
            entries.remove(stream_id);
        }
    }
}

/// Removes its tracker entry and aborts the statement task when dropped,
/// whichever way the execution ends.
pub struct ExecutionGuard {
    tracker: Arc<ExecutionTracker>,
    stream_id: String,
    id: u64,
    cancel: Arc<Notify>,
    task: Option<AbortHandle>,
}

impl ExecutionGuard {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn set_state(&self, state: ExecutionState) {
        self.tracker.set_state(&self.stream_id, self.id, state);
    }

    fn cancel_signal(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    fn attach(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.tracker.remove(&self.stream_id, self.id);
        self.tracker.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

enum Outcome {
    Finished(DbResult<crate::models::QueryResult>),
    Panicked,
    Cancelled,
    TimedOut,
}

impl Manager {
    /// Run one request inside a transaction.
    ///
    /// Statement errors come back as a result carrying `EXECUTION_ERROR`.
    /// Lifecycle failures (no session, transaction start, timeout, cancel,
    /// commit) are returned as `Err`.
    pub async fn execute_query(&self, request: ExecuteQueryRequest) -> DbResult<QueryExecutionResult> {
        let started = Instant::now();
        let ceiling = self.inner.config.execution_ceiling;
        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(ceiling, |t| t.min(ceiling));

        let mut guard = self.inner.executions.register(&request)?;
        let executor = self.get_connection(&request.chat_id).await?;
        let driver = executor.driver().clone();

        let mut tx = driver.begin_tx(executor.handle()).await;
        if let Some(err) = tx.start_error().cloned() {
            if let Err(rollback_err) = tx.rollback().await {
                debug!(error = %rollback_err, "Rollback after failed start");
            }
            warn!(chat_id = %request.chat_id, stream_id = %request.stream_id, error = %err, "Transaction did not start");
            return Err(match err {
                DbError::TransactionStart { .. } => err,
                other => DbError::transaction_start(other.to_string()),
            });
        }

        guard.set_state(ExecutionState::Executing);
        debug!(
            chat_id = %request.chat_id,
            stream_id = %request.stream_id,
            query_id = %request.query_id,
            deadline_ms = deadline.as_millis() as u64,
            "Executing query"
        );

        let tx: SharedTransaction = Arc::new(tokio::sync::Mutex::new(tx));
        let mut task = {
            let tx = tx.clone();
            let query = request.query.clone();
            let query_type = request.query_type.clone();
            let find_count = request.find_count;
            tokio::spawn(async move {
                let mut tx = tx.lock().await;
                tx.execute_query(&query, query_type.as_deref(), find_count)
                    .await
            })
        };
        guard.attach(task.abort_handle());

        let cancel = guard.cancel_signal();
        let outcome = tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(result) => Outcome::Finished(result),
                Err(_) => Outcome::Panicked,
            },
            _ = cancel.notified() => Outcome::Cancelled,
            _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
        };

        let elapsed_ms = || started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Cancelled => {
                task.abort();
                self.settle_rollback(&tx, &request.stream_id, true).await;
                guard.set_state(ExecutionState::Cancelled);
                info!(stream_id = %request.stream_id, "Query execution cancelled");
                Err(DbError::cancelled(request.stream_id.clone()))
            }
            Outcome::TimedOut => {
                task.abort();
                self.settle_rollback(&tx, &request.stream_id, true).await;
                guard.set_state(ExecutionState::TimedOut);
                let timeout_ms = deadline.as_millis() as u64;
                warn!(stream_id = %request.stream_id, timeout_ms, "Query execution timed out");
                Err(DbError::timeout("query execution", timeout_ms))
            }
            Outcome::Panicked => {
                self.settle_rollback(&tx, &request.stream_id, false).await;
                guard.set_state(ExecutionState::RolledBack);
                Err(DbError::internal("Statement task panicked"))
            }
            Outcome::Finished(Err(err)) => {
                self.settle_rollback(&tx, &request.stream_id, false).await;
                guard.set_state(ExecutionState::RolledBack);
                debug!(stream_id = %request.stream_id, error = %err, "Statement failed");
                Ok(QueryExecutionResult::statement_failure(&err, elapsed_ms()))
            }
            Outcome::Finished(Ok(result)) if request.is_rollback => {
                self.settle_rollback(&tx, &request.stream_id, false).await;
                guard.set_state(ExecutionState::RolledBack);
                Ok(QueryExecutionResult::success(result, elapsed_ms()))
            }
            Outcome::Finished(Ok(result)) => {
                let committed = tx.lock().await.commit().await;
                if let Err(err) = committed {
                    self.settle_rollback(&tx, &request.stream_id, false).await;
                    guard.set_state(ExecutionState::RolledBack);
                    return Err(DbError::transaction(format!("Commit failed: {}", err)));
                }
                guard.set_state(ExecutionState::Committed);

                if driver.is_schema_mutation(&request.query, request.query_type.as_deref()) {
                    self.schedule_schema_recheck(&request.chat_id);
                }
                Ok(QueryExecutionResult::success(result, elapsed_ms()))
            }
        }
    }

    /// Cancel the query running for `stream_id`. Unknown streams are a no-op.
    pub fn cancel_query_execution(&self, stream_id: &str) {
        if self.inner.executions.cancel(stream_id) {
            info!(stream_id = %stream_id, "Cancellation requested");
        } else {
            debug!(stream_id = %stream_id, "No execution to cancel");
        }
    }

    /// Roll `tx` back, waiting at most `rollback_timeout`. An abandoned
    /// statement is interrupted first where the backend allows it; otherwise
    /// the connection stays busy until the backend finishes the statement.
    async fn settle_rollback(&self, tx: &SharedTransaction, stream_id: &str, abandoned: bool) {
        let bound = self.inner.config.rollback_timeout;
        let mut rollback = tokio::spawn(roll_back(tx.clone(), stream_id.to_string(), abandoned));
        if tokio::time::timeout(bound, &mut rollback).await.is_err() {
            warn!(
                stream_id = %stream_id,
                timeout_ms = bound.as_millis() as u64,
                "Rollback still pending, continuing in background"
            );
            self.inner.executions.park(rollback);
        }
    }
}

async fn roll_back(tx: SharedTransaction, stream_id: String, abandoned: bool) {
    let mut tx = tx.lock().await;
    if abandoned && let Err(err) = tx.interrupt().await {
        debug!(stream_id = %stream_id, error = %err, "Statement interrupt failed");
    }
    if let Err(err) = tx.rollback().await {
        warn!(stream_id = %stream_id, error = %err, "Rollback failed");
    }
}
