//! Driver and transaction contracts.
//!
//! One [`Driver`] exists per backend type and is selected through the
//! [`DriverRegistry`]. Physical handles are type-erased behind
//! [`PhysicalConnection`] so the manager can share them without knowing the
//! backend; each driver downcasts back to its own handle type.
//!
//! `begin_tx` never fails. A transaction that could not start carries the
//! error in [`Transaction::start_error`], so callers can always roll back.

use crate::db::mongo::MongoDriver;
use crate::db::sql::SqlDriver;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryResult};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Type-erased physical handle (a sqlx pool, a MongoDB client, ...).
pub trait PhysicalConnection: Send + Sync + 'static {
    fn db_type(&self) -> DatabaseType;

    fn as_any(&self) -> &dyn Any;
}

pub type ConnectionHandle = Arc<dyn PhysicalConnection>;

/// Downcast a shared handle to a driver's concrete handle type.
pub fn downcast_handle<T: PhysicalConnection>(handle: &ConnectionHandle) -> DbResult<&T> {
    handle.as_any().downcast_ref::<T>().ok_or_else(|| {
        DbError::internal(format!(
            "Connection handle for {} does not belong to this driver",
            handle.db_type()
        ))
    })
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Open and verify a physical handle. Nothing is left open on error.
    async fn connect(&self, config: &ConnectionConfig) -> DbResult<ConnectionHandle>;

    /// Release the handle. Calling it twice is harmless.
    async fn disconnect(&self, conn: &ConnectionHandle) -> DbResult<()>;

    async fn ping(&self, conn: &ConnectionHandle) -> DbResult<()>;

    async fn is_alive(&self, conn: &ConnectionHandle) -> bool {
        self.ping(conn).await.is_ok()
    }

    /// Run a statement outside any explicit transaction. Dropping the
    /// returned future abandons the statement.
    async fn execute_query(
        &self,
        conn: &ConnectionHandle,
        query: &str,
        query_type: Option<&str>,
        find_count: bool,
    ) -> DbResult<QueryResult>;

    async fn begin_tx(&self, conn: &ConnectionHandle) -> Box<dyn Transaction>;

    /// Whether a committed `query` may have changed the schema.
    fn is_schema_mutation(&self, query: &str, query_type: Option<&str>) -> bool;
}

#[async_trait]
pub trait Transaction: Send {
    /// Error recorded when the transaction could not be started.
    fn start_error(&self) -> Option<&DbError>;

    async fn execute_query(
        &mut self,
        query: &str,
        query_type: Option<&str>,
        find_count: bool,
    ) -> DbResult<QueryResult>;

    async fn commit(&mut self) -> DbResult<()>;

    /// Ask the backend to stop the statement running in this transaction.
    /// Does nothing for backends without an out-of-band interrupt.
    async fn interrupt(&mut self) -> DbResult<()> {
        Ok(())
    }

    /// Returns the start error for a transaction that never started and
    /// `Ok(())` once the transaction has already finished.
    async fn rollback(&mut self) -> DbResult<()>;
}

/// Backend type to driver lookup.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DatabaseType, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in SQL and MongoDB drivers.
    pub fn with_defaults(row_limit: u32) -> Self {
        let mut registry = Self::new();
        for db_type in [DatabaseType::PostgreSQL, DatabaseType::MySQL, DatabaseType::SQLite] {
            registry.register(Arc::new(SqlDriver::new(db_type, row_limit)));
        }
        registry.register(Arc::new(MongoDriver::new(row_limit)));
        registry
    }

    /// Register a driver, replacing any previous one for the same type.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.db_type(), driver);
    }

    pub fn get(&self, db_type: DatabaseType) -> DbResult<Arc<dyn Driver>> {
        self.drivers
            .get(&db_type)
            .cloned()
            .ok_or_else(|| DbError::no_driver(db_type))
    }

    pub fn contains(&self, db_type: DatabaseType) -> bool {
        self.drivers.contains_key(&db_type)
    }

    pub fn types(&self) -> Vec<DatabaseType> {
        let mut types: Vec<_> = self.drivers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("types", &self.types())
            .finish()
    }
}
