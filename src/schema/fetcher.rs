//! Backend schema introspection.
//!
//! Each fetcher turns a live session into a [`SchemaSnapshot`]. SQL catalog
//! queries live in the `queries` submodule, one block per backend.

use crate::db::{DbPool, SessionExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnDefinition, DatabaseType, SchemaSnapshot, TableDefinition};
use async_trait::async_trait;
use mongodb::bson::{Bson, doc};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::debug;

#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch(&self, executor: &SessionExecutor) -> DbResult<SchemaSnapshot>;
}

// =============================================================================
// SQL Queries
// =============================================================================

mod queries {
    pub mod postgres {
        pub const TABLE_COLUMNS: &str = r#"
            SELECT
                t.table_name::text AS table_name,
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable::text AS is_nullable
            FROM information_schema.tables t
            LEFT JOIN information_schema.columns c
                ON c.table_schema = t.table_schema AND c.table_name = t.table_name
            WHERE t.table_schema = current_schema()
              AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_name, c.ordinal_position
        "#;
    }

    pub mod mysql {
        pub const TABLE_COLUMNS: &str = r#"
            SELECT
                CAST(t.TABLE_NAME AS CHAR) AS table_name,
                CAST(c.COLUMN_NAME AS CHAR) AS column_name,
                CAST(c.COLUMN_TYPE AS CHAR) AS data_type,
                CAST(c.IS_NULLABLE AS CHAR) AS is_nullable
            FROM information_schema.TABLES t
            LEFT JOIN information_schema.COLUMNS c
                ON c.TABLE_SCHEMA = t.TABLE_SCHEMA AND c.TABLE_NAME = t.TABLE_NAME
            WHERE t.TABLE_SCHEMA = DATABASE()
              AND t.TABLE_TYPE = 'BASE TABLE'
            ORDER BY t.TABLE_NAME, c.ORDINAL_POSITION
        "#;
    }

    pub mod sqlite {
        pub const TABLE_COLUMNS: &str = r#"
            SELECT
                m.name AS table_name,
                p.name AS column_name,
                p.type AS data_type,
                p."notnull" AS not_null
            FROM sqlite_master m
            JOIN pragma_table_info(m.name) p
            WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
            ORDER BY m.name, p.cid
        "#;
    }
}

/// One catalog row: table, then column details when the table has any.
type CatalogRow = (String, Option<ColumnDefinition>);

fn fold_catalog(rows: Vec<CatalogRow>) -> Vec<TableDefinition> {
    let mut tables: BTreeMap<String, TableDefinition> = BTreeMap::new();
    for (table, column) in rows {
        let entry = tables
            .entry(table.clone())
            .or_insert_with(|| TableDefinition::new(table));
        if let Some(column) = column {
            entry.columns.push(column);
        }
    }
    tables.into_values().collect()
}

/// Introspects PostgreSQL, MySQL and SQLite catalogs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlSchemaFetcher;

#[async_trait]
impl SchemaFetcher for SqlSchemaFetcher {
    async fn fetch(&self, executor: &SessionExecutor) -> DbResult<SchemaSnapshot> {
        let pool = executor.sql_pool().ok_or_else(|| {
            DbError::internal(format!(
                "Session for chat '{}' is not backed by a SQL pool",
                executor.chat_id()
            ))
        })?;

        let rows = match pool {
            DbPool::Postgres(p) => postgres::table_columns(p).await?,
            DbPool::MySql(p) => mysql::table_columns(p).await?,
            DbPool::SQLite(p) => sqlite::table_columns(p).await?,
        };
        let tables = fold_catalog(rows);
        debug!(
            chat_id = %executor.chat_id(),
            db_type = %pool.db_type(),
            tables = tables.len(),
            "Fetched SQL schema"
        );
        Ok(SchemaSnapshot::new(pool.db_type(), tables))
    }
}

mod postgres {
    use super::*;
    use sqlx::PgPool;

    pub async fn table_columns(pool: &PgPool) -> DbResult<Vec<CatalogRow>> {
        let rows = sqlx::query(queries::postgres::TABLE_COLUMNS)
            .fetch_all(pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get("table_name");
                let column = row
                    .try_get::<Option<String>, _>("column_name")
                    .ok()
                    .flatten()
                    .map(|name| {
                        let data_type: Option<String> = row.try_get("data_type").ok().flatten();
                        let nullable: Option<String> = row.try_get("is_nullable").ok().flatten();
                        ColumnDefinition::new(
                            name,
                            data_type.unwrap_or_default(),
                            nullable.as_deref() == Some("YES"),
                        )
                    });
                (table, column)
            })
            .collect())
    }
}

mod mysql {
    use super::*;
    use sqlx::MySqlPool;

    pub async fn table_columns(pool: &MySqlPool) -> DbResult<Vec<CatalogRow>> {
        let rows = sqlx::query(queries::mysql::TABLE_COLUMNS)
            .fetch_all(pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let table: String = row.try_get("table_name").ok()?;
                let column = row
                    .try_get::<Option<String>, _>("column_name")
                    .ok()
                    .flatten()
                    .map(|name| {
                        let data_type: Option<String> = row.try_get("data_type").ok().flatten();
                        let nullable: Option<String> = row.try_get("is_nullable").ok().flatten();
                        ColumnDefinition::new(
                            name,
                            data_type.unwrap_or_default(),
                            nullable.as_deref() == Some("YES"),
                        )
                    });
                Some((table, column))
            })
            .collect())
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqlitePool;

    pub async fn table_columns(pool: &SqlitePool) -> DbResult<Vec<CatalogRow>> {
        let rows = sqlx::query(queries::sqlite::TABLE_COLUMNS)
            .fetch_all(pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get("table_name");
                let name: Option<String> = row.try_get("column_name").ok().flatten();
                let column = name.map(|name| {
                    let data_type: Option<String> = row.try_get("data_type").ok().flatten();
                    let not_null: i64 = row.try_get("not_null").unwrap_or(0);
                    ColumnDefinition::new(name, data_type.unwrap_or_default(), not_null == 0)
                });
                (table, column)
            })
            .collect())
    }
}

/// Lists MongoDB collections. Collections carry no column definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoSchemaFetcher;

#[async_trait]
impl SchemaFetcher for MongoSchemaFetcher {
    async fn fetch(&self, executor: &SessionExecutor) -> DbResult<SchemaSnapshot> {
        let connection =
            crate::db::downcast_handle::<crate::db::MongoConnection>(executor.handle())?;
        let reply = connection
            .database()
            .run_command(doc! { "listCollections": 1, "nameOnly": true })
            .await?;

        let names: Vec<String> = reply
            .get_document("cursor")
            .ok()
            .and_then(|cursor| cursor.get_array("firstBatch").ok())
            .map(|batch| {
                batch
                    .iter()
                    .filter_map(|entry| match entry {
                        Bson::Document(d) => d.get_str("name").ok().map(String::from),
                        _ => None,
                    })
                    .filter(|name| !name.starts_with("system."))
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            chat_id = %executor.chat_id(),
            collections = names.len(),
            "Fetched MongoDB collections"
        );
        Ok(SchemaSnapshot::new(
            DatabaseType::MongoDB,
            names.into_iter().map(TableDefinition::new),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Driver, SqlDriver};
    use crate::models::ConnectionConfig;
    use std::sync::Arc;

    #[test]
    fn test_fold_catalog_groups_columns() {
        let rows = vec![
            ("users".to_string(), Some(ColumnDefinition::new("id", "integer", false))),
            ("users".to_string(), Some(ColumnDefinition::new("name", "text", true))),
            ("empty".to_string(), None),
        ];
        let tables = fold_catalog(rows);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "empty");
        assert!(tables[0].columns.is_empty());
        assert_eq!(tables[1].columns.len(), 2);
        assert_eq!(tables[1].columns[1].name, "name");
    }

    #[tokio::test]
    async fn test_sqlite_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.db");
        let driver = Arc::new(SqlDriver::new(DatabaseType::SQLite, 100));
        let config = ConnectionConfig::sqlite(path.to_string_lossy().to_string());
        let handle = driver.connect(&config).await.unwrap();
        let executor = SessionExecutor::new("chat", driver.clone(), handle.clone());

        executor
            .execute_query(
                "CREATE TABLE users (id INTEGER NOT NULL, email TEXT)",
                None,
                false,
            )
            .await
            .unwrap();

        let snapshot = SqlSchemaFetcher.fetch(&executor).await.unwrap();
        let users = snapshot.table("users").unwrap();
        assert_eq!(users.columns.len(), 2);
        assert_eq!(users.columns[0].name, "id");
        assert_eq!(users.columns[0].data_type, "INTEGER");
        assert!(!users.columns[0].nullable);
        assert!(users.columns[1].nullable);

        driver.disconnect(&handle).await.unwrap();
    }
}
