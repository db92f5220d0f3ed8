//! In-memory [`SchemaService`].

use super::fetcher::{MongoSchemaFetcher, SchemaFetcher, SqlSchemaFetcher};
use super::{SchemaError, SchemaResult, SchemaService};
use crate::db::SessionExecutor;
use crate::models::{DatabaseType, SchemaDiff, SchemaSnapshot, SelectedCollections};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Fetcher registry plus a per-chat snapshot cache.
pub struct DefaultSchemaService {
    fetchers: HashMap<DatabaseType, Arc<dyn SchemaFetcher>>,
    cache: RwLock<HashMap<String, SchemaSnapshot>>,
}

impl DefaultSchemaService {
    /// Service without fetchers. Every check reports [`SchemaError::NoFetcher`].
    pub fn new() -> Self {
        Self {
            fetchers: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Service with fetchers for every built-in backend.
    pub fn with_defaults() -> Self {
        let sql: Arc<dyn SchemaFetcher> = Arc::new(SqlSchemaFetcher);
        Self::new()
            .with_fetcher(DatabaseType::PostgreSQL, sql.clone())
            .with_fetcher(DatabaseType::MySQL, sql.clone())
            .with_fetcher(DatabaseType::SQLite, sql)
            .with_fetcher(DatabaseType::MongoDB, Arc::new(MongoSchemaFetcher))
    }

    pub fn with_fetcher(mut self, db_type: DatabaseType, fetcher: Arc<dyn SchemaFetcher>) -> Self {
        self.fetchers.insert(db_type, fetcher);
        self
    }

    fn fetcher(&self, db_type: DatabaseType) -> SchemaResult<&Arc<dyn SchemaFetcher>> {
        self.fetchers
            .get(&db_type)
            .ok_or(SchemaError::NoFetcher { db_type })
    }
}

impl Default for DefaultSchemaService {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl SchemaService for DefaultSchemaService {
    async fn get_schema(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        selected: &str,
    ) -> SchemaResult<SchemaSnapshot> {
        let snapshot = self.fetcher(db_type)?.fetch(executor).await?;
        debug!(chat_id = %chat_id, tables = snapshot.tables.len(), "Fetched schema");
        Ok(snapshot.filtered(&SelectedCollections::parse(selected)))
    }

    async fn get_table_checksum(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        table: &str,
    ) -> SchemaResult<String> {
        let snapshot = self.fetcher(db_type)?.fetch(executor).await?;
        snapshot
            .table(table)
            .map(|t| t.checksum())
            .ok_or_else(|| SchemaError::TableNotFound {
                chat_id: chat_id.to_string(),
                table: table.to_string(),
            })
    }

    async fn check_schema_changes(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        selected: &str,
    ) -> SchemaResult<(SchemaDiff, bool)> {
        let fresh = self.get_schema(chat_id, executor, db_type, selected).await?;

        let mut cache = self.cache.write().await;
        let Some(previous) = cache.insert(chat_id.to_string(), fresh.clone()) else {
            debug!(chat_id = %chat_id, "Stored initial schema snapshot");
            return Err(SchemaError::NoCachedSchema {
                chat_id: chat_id.to_string(),
            });
        };
        drop(cache);

        let diff = SchemaDiff::between(&previous, &fresh);
        let changed = !diff.is_empty();
        if changed {
            info!(
                chat_id = %chat_id,
                added = diff.added_tables.len(),
                removed = diff.removed_tables.len(),
                modified = diff.modified_tables.len(),
                "Schema drift detected"
            );
        }
        Ok((diff, changed))
    }

    async fn clear_cache(&self, chat_id: &str) {
        if self.cache.write().await.remove(chat_id).is_some() {
            debug!(chat_id = %chat_id, "Cleared cached schema");
        }
    }

    async fn store_cache(&self, chat_id: &str, snapshot: SchemaSnapshot) {
        self.cache.write().await.insert(chat_id.to_string(), snapshot);
    }

    async fn cached_schema(&self, chat_id: &str) -> Option<SchemaSnapshot> {
        self.cache.read().await.get(chat_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Driver, SqlDriver};
    use crate::error::DbResult;
    use crate::models::{ConnectionConfig, TableDefinition};
    use std::sync::Mutex;

    /// Returns queued snapshots in order.
    struct ScriptedFetcher {
        snapshots: Mutex<Vec<SchemaSnapshot>>,
    }

    #[async_trait]
    impl SchemaFetcher for ScriptedFetcher {
        async fn fetch(&self, _executor: &SessionExecutor) -> DbResult<SchemaSnapshot> {
            Ok(self.snapshots.lock().unwrap().remove(0))
        }
    }

    async fn sqlite_executor(dir: &tempfile::TempDir) -> SessionExecutor {
        let driver = Arc::new(SqlDriver::new(DatabaseType::SQLite, 10));
        let path = dir.path().join("svc.db");
        let handle = driver
            .connect(&ConnectionConfig::sqlite(path.to_string_lossy().to_string()))
            .await
            .unwrap();
        SessionExecutor::new("chat", driver, handle)
    }

    fn snapshot(tables: &[&str]) -> SchemaSnapshot {
        SchemaSnapshot::new(
            DatabaseType::SQLite,
            tables.iter().map(|t| TableDefinition::new(*t)),
        )
    }

    #[tokio::test]
    async fn test_first_check_stores_then_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = sqlite_executor(&dir).await;
        let fetcher = Arc::new(ScriptedFetcher {
            snapshots: Mutex::new(vec![
                snapshot(&["users"]),
                snapshot(&["users", "orders"]),
                snapshot(&["users", "orders"]),
            ]),
        });
        let service = DefaultSchemaService::new().with_fetcher(DatabaseType::SQLite, fetcher);

        let first = service
            .check_schema_changes("chat", &executor, DatabaseType::SQLite, "ALL")
            .await;
        assert!(matches!(first, Err(SchemaError::NoCachedSchema { .. })));
        assert!(service.cached_schema("chat").await.is_some());

        let (diff, changed) = service
            .check_schema_changes("chat", &executor, DatabaseType::SQLite, "ALL")
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(diff.added_tables[0].name, "orders");

        let (_, changed) = service
            .check_schema_changes("chat", &executor, DatabaseType::SQLite, "ALL")
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_missing_fetcher_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let executor = sqlite_executor(&dir).await;
        let service = DefaultSchemaService::new();
        let err = service
            .check_schema_changes("chat", &executor, DatabaseType::SQLite, "ALL")
            .await
            .unwrap_err();
        assert!(err.is_benign());
    }

    #[tokio::test]
    async fn test_table_checksum_reads_live_table() {
        let dir = tempfile::tempdir().unwrap();
        let executor = sqlite_executor(&dir).await;
        executor
            .execute_query("CREATE TABLE users (id INTEGER)", None, false)
            .await
            .unwrap();
        let service = DefaultSchemaService::with_defaults();

        let before = service
            .get_table_checksum("chat", &executor, DatabaseType::SQLite, "users")
            .await
            .unwrap();
        executor
            .execute_query("ALTER TABLE users ADD COLUMN email TEXT", None, false)
            .await
            .unwrap();
        let after = service
            .get_table_checksum("chat", &executor, DatabaseType::SQLite, "users")
            .await
            .unwrap();
        assert_ne!(before, after);
        assert!(service.cached_schema("chat").await.is_none());

        assert!(matches!(
            service
                .get_table_checksum("chat", &executor, DatabaseType::SQLite, "nope")
                .await,
            Err(SchemaError::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_and_clear_cache() {
        let service = DefaultSchemaService::new();
        service.store_cache("chat", snapshot(&["users"])).await;
        assert!(service.cached_schema("chat").await.unwrap().table("users").is_some());

        service.clear_cache("chat").await;
        assert!(service.cached_schema("chat").await.is_none());
    }

    #[tokio::test]
    async fn test_selection_filters_real_schema() {
        let dir = tempfile::tempdir().unwrap();
        let executor = sqlite_executor(&dir).await;
        executor
            .execute_query("CREATE TABLE a (x INTEGER)", None, false)
            .await
            .unwrap();
        executor
            .execute_query("CREATE TABLE b (y INTEGER)", None, false)
            .await
            .unwrap();

        let service = DefaultSchemaService::with_defaults();
        let snapshot = service
            .get_schema("chat", &executor, DatabaseType::SQLite, "b")
            .await
            .unwrap();
        assert!(snapshot.table("a").is_none());
        assert!(snapshot.table("b").is_some());
    }
}
