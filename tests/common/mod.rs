//! Shared fixtures: an instrumented in-memory driver and a counting schema
//! service.
//!
//! Mock statements:
//! - `SLEEP` never completes
//! - anything starting with `FAIL` returns a database error
//! - `CREATE`/`ALTER`/`DROP` report zero rows affected and count as schema
//!   mutations
//! - everything else returns one row `{"value": 1}`

#![allow(dead_code)]

use async_trait::async_trait;
use chat_db_orchestrator::config::ManagerConfig;
use chat_db_orchestrator::db::{
    ConnectionHandle, Driver, DriverRegistry, PhysicalConnection, SessionExecutor, Transaction,
};
use chat_db_orchestrator::error::{DbError, DbResult};
use chat_db_orchestrator::liveness::InMemoryLivenessStore;
use chat_db_orchestrator::manager::Manager;
use chat_db_orchestrator::models::{
    ConnectionConfig, DatabaseType, QueryResult, SchemaDiff, SchemaSnapshot, TableDefinition,
};
use chat_db_orchestrator::schema::{SchemaError, SchemaResult, SchemaService};
use chat_db_orchestrator::stream::{BroadcastStreamHandler, StreamMessage};
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
pub struct MockStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_ping: AtomicBool,
    /// Overrides the default 5ms open delay when non-zero
    pub connect_delay_ms: AtomicU64,
    /// Rollbacks wait this long before completing
    pub rollback_delay_ms: AtomicU64,
}

impl MockStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    db_type: DatabaseType,
}

impl PhysicalConnection for MockConnection {
    fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockDriver {
    db_type: DatabaseType,
    pub stats: Arc<MockStats>,
}

impl MockDriver {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            stats: Arc::new(MockStats::default()),
        }
    }
}

fn is_ddl(query: &str) -> bool {
    let upper = query.trim_start().to_ascii_uppercase();
    ["CREATE", "ALTER", "DROP"]
        .iter()
        .any(|kw| upper.starts_with(kw))
}

async fn run_mock(query: &str) -> DbResult<QueryResult> {
    let trimmed = query.trim();
    if trimmed == "SLEEP" {
        std::future::pending::<()>().await;
    }
    if trimmed.starts_with("FAIL") {
        return Err(DbError::database(
            format!("syntax error near \"{}\"", trimmed),
            Some("42601".to_string()),
            "Check the SQL syntax",
        ));
    }
    if is_ddl(trimmed) {
        return Ok(QueryResult::affected(0));
    }
    let mut row = serde_json::Map::new();
    row.insert("value".to_string(), json!(1));
    Ok(QueryResult::rows(vec!["value".to_string()], vec![row], false))
}

#[async_trait]
impl Driver for MockDriver {
    fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn connect(&self, _config: &ConnectionConfig) -> DbResult<ConnectionHandle> {
        if self.stats.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "Is the server running?"));
        }
        // Widen the window for concurrent connects.
        let delay = match self.stats.connect_delay_ms.load(Ordering::SeqCst) {
            0 => 5,
            ms => ms,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            db_type: self.db_type,
        }))
    }

    async fn disconnect(&self, _conn: &ConnectionHandle) -> DbResult<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _conn: &ConnectionHandle) -> DbResult<()> {
        if self.stats.fail_ping.load(Ordering::SeqCst) {
            Err(DbError::connection("server closed the connection", "Reconnect"))
        } else {
            Ok(())
        }
    }

    async fn execute_query(
        &self,
        _conn: &ConnectionHandle,
        query: &str,
        _query_type: Option<&str>,
        _find_count: bool,
    ) -> DbResult<QueryResult> {
        run_mock(query).await
    }

    async fn begin_tx(&self, _conn: &ConnectionHandle) -> Box<dyn Transaction> {
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        let start_error = self
            .stats
            .fail_begin
            .load(Ordering::SeqCst)
            .then(|| DbError::transaction_start("too many connections"));
        Box::new(MockTransaction {
            stats: self.stats.clone(),
            start_error,
            finished: false,
        })
    }

    fn is_schema_mutation(&self, query: &str, _query_type: Option<&str>) -> bool {
        is_ddl(query)
    }
}

pub struct MockTransaction {
    stats: Arc<MockStats>,
    start_error: Option<DbError>,
    finished: bool,
}

#[async_trait]
impl Transaction for MockTransaction {
    fn start_error(&self) -> Option<&DbError> {
        self.start_error.as_ref()
    }

    async fn execute_query(
        &mut self,
        query: &str,
        _query_type: Option<&str>,
        _find_count: bool,
    ) -> DbResult<QueryResult> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        run_mock(query).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        self.finished = true;
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&mut self) -> DbResult<()> {
        self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        let delay = self.stats.rollback_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.finished {
            self.finished = true;
            self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Schema service that only counts checks.
#[derive(Default)]
pub struct CountingSchemaService {
    pub checks: AtomicUsize,
    pub cleared: AtomicUsize,
    /// Report drift on every check
    pub report_changes: AtomicBool,
    pub cache: Mutex<Option<SchemaSnapshot>>,
}

impl CountingSchemaService {
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaService for CountingSchemaService {
    async fn get_schema(
        &self,
        _chat_id: &str,
        _executor: &SessionExecutor,
        db_type: DatabaseType,
        _selected: &str,
    ) -> SchemaResult<SchemaSnapshot> {
        Ok(SchemaSnapshot::new(db_type, Vec::new()))
    }

    async fn get_table_checksum(
        &self,
        chat_id: &str,
        _executor: &SessionExecutor,
        _db_type: DatabaseType,
        table: &str,
    ) -> SchemaResult<String> {
        Err(SchemaError::TableNotFound {
            chat_id: chat_id.to_string(),
            table: table.to_string(),
        })
    }

    async fn check_schema_changes(
        &self,
        _chat_id: &str,
        _executor: &SessionExecutor,
        _db_type: DatabaseType,
        _selected: &str,
    ) -> SchemaResult<(SchemaDiff, bool)> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.report_changes.load(Ordering::SeqCst) {
            let diff = SchemaDiff {
                added_tables: vec![TableDefinition::new("orders")],
                ..Default::default()
            };
            Ok((diff, true))
        } else {
            Ok((SchemaDiff::default(), false))
        }
    }

    async fn clear_cache(&self, _chat_id: &str) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    async fn store_cache(&self, _chat_id: &str, snapshot: SchemaSnapshot) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(snapshot);
        }
    }

    async fn cached_schema(&self, _chat_id: &str) -> Option<SchemaSnapshot> {
        self.cache.lock().ok().and_then(|c| c.clone())
    }
}

/// Timings that keep background work out of the way unless a test asks
/// for it.
pub fn quiet_config() -> ManagerConfig {
    ManagerConfig {
        idle_timeout: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(3600),
        schema_check_interval: Duration::from_secs(3600),
        schema_settle_delay: Duration::from_secs(3600),
        schema_recheck_delay: Duration::from_millis(20),
        execution_ceiling: Duration::from_secs(5),
        ping_timeout: Duration::from_millis(200),
        rollback_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_secs(1),
        max_loop_restarts: 5,
    }
}

pub struct Harness {
    pub manager: Manager,
    pub stats: Arc<MockStats>,
    pub schema: Arc<CountingSchemaService>,
    pub stream: Arc<BroadcastStreamHandler>,
    pub liveness: Arc<InMemoryLivenessStore>,
}

impl Harness {
    pub fn new(config: ManagerConfig) -> Self {
        let driver = MockDriver::new(DatabaseType::PostgreSQL);
        let stats = driver.stats.clone();
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(driver));

        let schema = Arc::new(CountingSchemaService::default());
        let stream = Arc::new(BroadcastStreamHandler::new(256));
        let liveness = Arc::new(InMemoryLivenessStore::new());
        let manager = Manager::new(
            config,
            drivers,
            schema.clone(),
            stream.clone(),
            liveness.clone(),
        );
        Self {
            manager,
            stats,
            schema,
            stream,
            liveness,
        }
    }

    pub fn quiet() -> Self {
        Self::new(quiet_config())
    }

    pub fn events(&self) -> broadcast::Receiver<StreamMessage> {
        self.stream.subscribe()
    }
}

pub fn pg_config(database: &str) -> ConnectionConfig {
    ConnectionConfig::new(DatabaseType::PostgreSQL, "db.internal", database)
        .with_credentials("app", "secret")
}

/// Next message matching `pred`, or `None` after `wait`.
pub async fn next_message<F>(
    rx: &mut broadcast::Receiver<StreamMessage>,
    wait: Duration,
    mut pred: F,
) -> Option<StreamMessage>
where
    F: FnMut(&StreamMessage) -> bool,
{
    tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(message) if pred(&message) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
