//! Idle resource reclamation and loop supervision.

use super::{ManagerInner, Session};
use crate::db::PoolEntry;
use crate::liveness::connection_key;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What one eviction pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub sessions: usize,
    pub pools: usize,
    pub executions: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.sessions == 0 && self.pools == 0 && self.executions == 0
    }
}

impl ManagerInner {
    /// Sessions, then pools, then stale tracker entries. Each sweep takes
    /// its own lock.
    pub(crate) async fn run_eviction_cycle(&self) -> EvictionReport {
        let idle_timeout = self.config.idle_timeout;

        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let idle: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > idle_timeout)
                .map(|(chat_id, _)| chat_id.clone())
                .collect();
            idle.iter().filter_map(|chat_id| sessions.remove(chat_id)).collect()
        };
        for session in &evicted {
            session.stop_schema_tracking();
            if let Some(binding) = session.binding() {
                binding.pool.release();
                self.liveness.remove(&connection_key(session.chat_id())).await;
            }
            debug!(chat_id = %session.chat_id(), "Evicted idle session");
        }

        let reclaimed: Vec<Arc<PoolEntry>> = {
            let mut pools = self.pools.write().await;
            let idle: Vec<String> = pools
                .iter()
                .filter(|(_, p)| p.is_reclaimable(idle_timeout))
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();
            idle.iter().filter_map(|fp| pools.remove(fp)).collect()
        };
        self.close_pools(&reclaimed).await;

        let executions = self.executions.sweep_stale(idle_timeout);

        EvictionReport {
            sessions: evicted.len(),
            pools: reclaimed.len(),
            executions,
        }
    }

    /// Close pools concurrently, each within `close_timeout`. A pool whose
    /// connection is still held by an abandoned statement is dropped once
    /// its budget passes; that connection closes when the backend lets go.
    /// Returns how many pools closed cleanly.
    pub(crate) async fn close_pools(&self, pools: &[Arc<PoolEntry>]) -> usize {
        let bound = self.config.close_timeout;
        let closes = pools.iter().map(|pool| async move {
            match tokio::time::timeout(bound, pool.driver().disconnect(pool.handle())).await {
                Ok(Ok(())) => {
                    debug!(fingerprint = %pool.fingerprint(), "Closed pool");
                    true
                }
                Ok(Err(err)) => {
                    warn!(fingerprint = %pool.fingerprint(), error = %err, "Failed to close pool");
                    false
                }
                Err(_) => {
                    warn!(
                        fingerprint = %pool.fingerprint(),
                        timeout_ms = bound.as_millis() as u64,
                        "Pool close timed out, dropping it"
                    );
                    false
                }
            }
        });
        futures_util::future::join_all(closes)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }
}

pub(crate) async fn eviction_loop(inner: Weak<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    let Some(interval) = inner.upgrade().map(|i| i.config.cleanup_interval) else {
        return;
    };
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let report = inner.run_eviction_cycle().await;
                if report.is_empty() {
                    debug!("Eviction pass found nothing idle");
                } else {
                    info!(
                        sessions = report.sessions,
                        pools = report.pools,
                        executions = report.executions,
                        "Eviction pass reclaimed resources"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Eviction loop stopped");
}

/// Run the loop produced by `make_loop`, restarting it after a panic.
///
/// Returns the number of restarts once the loop exits normally, is
/// cancelled, or panics with no restarts left.
pub async fn supervise<F, Fut>(name: &str, max_restarts: u32, mut make_loop: F) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts = 0;
    loop {
        match tokio::spawn(make_loop()).await {
            Ok(()) => return restarts,
            Err(err) if err.is_panic() => {
                if restarts >= max_restarts {
                    error!(
                        task = name,
                        restarts,
                        "Background loop panicked, restart limit reached"
                    );
                    return restarts;
                }
                restarts += 1;
                warn!(task = name, restarts, "Background loop panicked, restarting");
            }
            Err(_) => return restarts,
        }
    }
}
