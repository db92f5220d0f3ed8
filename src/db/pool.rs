//! Reference-counted pool entries.
//!
//! A [`PoolEntry`] wraps one physical handle and is shared by every session
//! whose config hashes to the same fingerprint. The reference count and
//! last-used time live on the entry itself, so updating one pool never takes
//! the registry lock.
//!
//! # Concurrency
//!
//! - `AtomicUsize` with `AcqRel`/`Acquire` ordering for the reference count
//! - `std::sync::RwLock<Instant>` for last-used, never held across `.await`
//! - `release` saturates at zero and logs the underflow attempt

use crate::db::driver::{ConnectionHandle, Driver};
use crate::models::{ConnectionConfig, DatabaseType};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Database-specific sqlx pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::MySql(pool) => pool.is_closed(),
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::SQLite(pool) => pool.is_closed(),
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Shared physical handle plus its bookkeeping.
pub struct PoolEntry {
    fingerprint: String,
    config: ConnectionConfig,
    handle: ConnectionHandle,
    driver: Arc<dyn Driver>,
    ref_count: AtomicUsize,
    last_used: std::sync::RwLock<Instant>,
    created_at: Instant,
}

impl PoolEntry {
    /// New entry holding one reference.
    pub fn new(
        fingerprint: impl Into<String>,
        config: ConnectionConfig,
        handle: ConnectionHandle,
        driver: Arc<dyn Driver>,
    ) -> Self {
        let now = Instant::now();
        Self {
            fingerprint: fingerprint.into(),
            config,
            handle,
            driver,
            ref_count: AtomicUsize::new(1),
            last_used: std::sync::RwLock::new(now),
            created_at: now,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Take one more reference. Returns the new count.
    pub fn acquire(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference, saturating at 0. Returns the new count.
    pub fn release(&self) -> usize {
        let result = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        match result {
            Ok(0) | Err(0) => {
                tracing::warn!(
                    fingerprint = %self.fingerprint,
                    "Pool reference count underflow detected - extra release call"
                );
                0
            }
            Ok(prev) | Err(prev) => prev - 1,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.write() {
            *last_used = Instant::now();
        }
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }

    /// Unreferenced and untouched for longer than `idle_timeout`.
    pub fn is_reclaimable(&self, idle_timeout: Duration) -> bool {
        self.ref_count() == 0 && self.last_used().elapsed() > idle_timeout
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("fingerprint", &self.fingerprint)
            .field("target", &self.config.masked())
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("created_at", &self.created_at)
            .finish()
    }
}
