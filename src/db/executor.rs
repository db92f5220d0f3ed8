//! Executor bound to one chat session.
//!
//! [`SessionExecutor`] is what `Manager::get_connection` hands out: the
//! session's driver plus its shared physical handle. Schema fetchers use it
//! to run catalog queries without going through the execution tracker.

use crate::db::driver::{ConnectionHandle, Driver, downcast_handle};
use crate::db::mongo::MongoConnection;
use crate::db::sql::SqlConnection;
use crate::db::DbPool;
use crate::error::DbResult;
use crate::models::{DatabaseType, QueryResult};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SessionExecutor {
    chat_id: String,
    driver: Arc<dyn Driver>,
    handle: ConnectionHandle,
}

impl SessionExecutor {
    pub fn new(chat_id: impl Into<String>, driver: Arc<dyn Driver>, handle: ConnectionHandle) -> Self {
        Self {
            chat_id: chat_id.into(),
            driver,
            handle,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.handle.db_type()
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Run one statement outside the execution tracker.
    pub async fn execute_query(
        &self,
        query: &str,
        query_type: Option<&str>,
        find_count: bool,
    ) -> DbResult<QueryResult> {
        debug!(chat_id = %self.chat_id, db_type = %self.db_type(), "Executing session query");
        self.driver
            .execute_query(&self.handle, query, query_type, find_count)
            .await
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.driver.ping(&self.handle).await
    }

    pub async fn is_alive(&self) -> bool {
        self.driver.is_alive(&self.handle).await
    }

    /// Underlying sqlx pool, for SQL sessions.
    pub fn sql_pool(&self) -> Option<&DbPool> {
        downcast_handle::<SqlConnection>(&self.handle)
            .ok()
            .map(SqlConnection::pool)
    }

    /// Underlying MongoDB client, for document sessions.
    pub fn mongo_client(&self) -> Option<&mongodb::Client> {
        downcast_handle::<MongoConnection>(&self.handle)
            .ok()
            .map(MongoConnection::client)
    }
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExecutor")
            .field("chat_id", &self.chat_id)
            .field("db_type", &self.db_type())
            .finish()
    }
}
