//! Schema tracking collaborator.
//!
//! The manager asks a [`SchemaService`] whether a chat's database changed
//! shape since the last look. [`DefaultSchemaService`] answers by fetching a
//! fresh snapshot through a backend [`SchemaFetcher`] and diffing it against
//! its cache.

pub mod fetcher;
pub mod service;

pub use fetcher::{MongoSchemaFetcher, SchemaFetcher, SqlSchemaFetcher};
pub use service::DefaultSchemaService;

use crate::db::SessionExecutor;
use crate::error::DbError;
use crate::models::{DatabaseType, SchemaDiff, SchemaSnapshot};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SchemaError {
    /// First look at a chat; the snapshot was stored and there is nothing to
    /// diff against yet.
    #[error("No cached schema for chat '{chat_id}'")]
    NoCachedSchema { chat_id: String },

    #[error("No schema fetcher registered for '{db_type}'")]
    NoFetcher { db_type: DatabaseType },

    #[error("Table '{table}' not found in schema of chat '{chat_id}'")]
    TableNotFound { chat_id: String, table: String },

    #[error(transparent)]
    Fetch(#[from] DbError),
}

impl SchemaError {
    /// Errors the tracking loop logs at debug level and otherwise ignores.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoCachedSchema { .. } | Self::NoFetcher { .. })
    }
}

pub type SchemaResult<T> = Result<T, SchemaError>;

#[async_trait]
pub trait SchemaService: Send + Sync {
    /// Fresh snapshot restricted to `selected` (`"ALL"` or a csv list).
    async fn get_schema(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        selected: &str,
    ) -> SchemaResult<SchemaSnapshot>;

    /// Checksum of one table as it currently exists in the backend.
    async fn get_table_checksum(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        table: &str,
    ) -> SchemaResult<String>;

    /// Fetch, diff against the cache and store the fresh snapshot.
    ///
    /// Returns the diff and whether anything changed.
    async fn check_schema_changes(
        &self,
        chat_id: &str,
        executor: &SessionExecutor,
        db_type: DatabaseType,
        selected: &str,
    ) -> SchemaResult<(SchemaDiff, bool)>;

    async fn clear_cache(&self, chat_id: &str);

    async fn store_cache(&self, chat_id: &str, snapshot: SchemaSnapshot);

    async fn cached_schema(&self, chat_id: &str) -> Option<SchemaSnapshot>;
}
