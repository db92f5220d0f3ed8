//! MongoDB driver.
//!
//! Queries are database command documents written as (extended) JSON, for
//! example `{"find": "users", "filter": {"age": {"$gt": 30}}}`. Cursor
//! replies become rows, write replies report `n` as rows affected, and any
//! other reply is returned as a single row.

use crate::db::classify::{is_mongo_schema_mutation, mongo_command_name, mongo_runs_outside_transaction};
use crate::db::driver::{ConnectionHandle, Driver, PhysicalConnection, Transaction, downcast_handle};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, JsonRow, QueryResult, SslMode};
use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, ClientSession, Database};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Physical handle of a MongoDB session: the client and its default database.
#[derive(Debug, Clone)]
pub struct MongoConnection {
    client: Client,
    database: String,
}

impl MongoConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn database(&self) -> Database {
        self.client.database(&self.database)
    }
}

impl PhysicalConnection for MongoConnection {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MongoDB
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct MongoDriver {
    row_limit: u32,
}

impl MongoDriver {
    pub fn new(row_limit: u32) -> Self {
        Self {
            row_limit: row_limit.max(1),
        }
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MongoDB
    }

    async fn connect(&self, config: &ConnectionConfig) -> DbResult<ConnectionHandle> {
        if config.db_type != DatabaseType::MongoDB {
            return Err(DbError::invalid_input(format!(
                "MongoDB driver cannot open a {} connection",
                config.db_type
            )));
        }

        let uri = connection_uri(config)?;
        let budget = config.pool_options.connect_timeout_or_default();

        let mut options = ClientOptions::parse(uri.as_str()).await.map_err(|e| {
            DbError::connection(format!("Invalid MongoDB URI: {}", e), "Verify the MongoDB URI")
        })?;
        options.app_name.get_or_insert_with(|| env!("CARGO_PKG_NAME").to_string());
        options.connect_timeout = Some(budget);
        options.server_selection_timeout = Some(budget);
        options.max_pool_size = Some(config.pool_options.max_connections_or_default(false));
        options.min_pool_size = Some(config.pool_options.min_connections_or_default());
        options.max_idle_time = Some(Duration::from_secs(
            config.pool_options.idle_timeout_or_default(),
        ));

        let client = Client::with_options(options)?;
        let conn = MongoConnection {
            client,
            database: config.database.clone(),
        };

        // Client construction is lazy; the ping is the first round trip.
        let db = conn.database();
        let verified = tokio::time::timeout(budget, db.run_command(doc! { "ping": 1 }))
            .await
            .map_err(|_| {
                DbError::connection(
                    format!(
                        "Timed out after {}ms connecting to {}",
                        budget.as_millis(),
                        config.masked()
                    ),
                    "Check that the MongoDB server is running and accessible",
                )
            })
            .and_then(|reply| reply.map_err(DbError::from));
        if let Err(e) = verified {
            conn.client.clone().shutdown().immediate(true).await;
            return Err(e);
        }

        info!(target_uri = %config.masked(), "Opened MongoDB client");
        Ok(Arc::new(conn))
    }

    async fn disconnect(&self, conn: &ConnectionHandle) -> DbResult<()> {
        let conn = downcast_handle::<MongoConnection>(conn)?;
        conn.client.clone().shutdown().immediate(true).await;
        debug!(database = %conn.database, "Closed MongoDB client");
        Ok(())
    }

    async fn ping(&self, conn: &ConnectionHandle) -> DbResult<()> {
        let conn = downcast_handle::<MongoConnection>(conn)?;
        conn.database().run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn execute_query(
        &self,
        conn: &ConnectionHandle,
        query: &str,
        _query_type: Option<&str>,
        find_count: bool,
    ) -> DbResult<QueryResult> {
        let conn = downcast_handle::<MongoConnection>(conn)?;
        let db = conn.database();
        let command = parse_command(query)?;
        run_with_count(&db, None, command, find_count, self.row_limit).await
    }

    async fn begin_tx(&self, conn: &ConnectionHandle) -> Box<dyn Transaction> {
        let conn = match downcast_handle::<MongoConnection>(conn) {
            Ok(conn) => conn.clone(),
            Err(e) => return Box::new(MongoTransaction::failed(e)),
        };

        let mut session = match conn.client.start_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to start MongoDB session");
                return Box::new(MongoTransaction::failed(DbError::transaction_start(
                    e.to_string(),
                )));
            }
        };
        if let Err(e) = session.start_transaction().await {
            warn!(error = %e, "Failed to start MongoDB transaction");
            return Box::new(MongoTransaction::failed(DbError::transaction_start(
                e.to_string(),
            )));
        }

        Box::new(MongoTransaction {
            database: Some(conn.database()),
            session: Some(session),
            start_error: None,
            row_limit: self.row_limit,
        })
    }

    fn is_schema_mutation(&self, query: &str, query_type: Option<&str>) -> bool {
        is_mongo_schema_mutation(query, query_type)
    }
}

/// Multi-document transaction on one client session.
///
/// Commands a transaction refuses (collection drops, renames, catalog reads)
/// run outside the session.
pub struct MongoTransaction {
    database: Option<Database>,
    session: Option<ClientSession>,
    start_error: Option<DbError>,
    row_limit: u32,
}

impl MongoTransaction {
    fn failed(error: DbError) -> Self {
        Self {
            database: None,
            session: None,
            start_error: Some(error),
            row_limit: 1,
        }
    }

    fn finished_error(&self) -> DbError {
        self.start_error
            .clone()
            .unwrap_or_else(|| DbError::transaction("Transaction has already finished"))
    }
}

#[async_trait]
impl Transaction for MongoTransaction {
    fn start_error(&self) -> Option<&DbError> {
        self.start_error.as_ref()
    }

    async fn execute_query(
        &mut self,
        query: &str,
        _query_type: Option<&str>,
        find_count: bool,
    ) -> DbResult<QueryResult> {
        if self.database.is_none() || self.session.is_none() {
            return Err(self.finished_error());
        }
        let (Some(database), Some(session)) = (self.database.as_ref(), self.session.as_mut()) else {
            return Err(DbError::transaction("Transaction has already finished"));
        };
        let command = parse_command(query)?;
        let name = command.keys().next().cloned().unwrap_or_default();

        if mongo_runs_outside_transaction(&name) {
            debug!(command = %name, "Running command outside the transaction");
            return run_with_count(database, None, command, find_count, self.row_limit).await;
        }
        run_with_count(
            database,
            Some(session),
            command,
            find_count,
            self.row_limit,
        )
        .await
    }

    async fn commit(&mut self) -> DbResult<()> {
        let mut session = self.session.take().ok_or_else(|| self.finished_error())?;
        session
            .commit_transaction()
            .await
            .map_err(|e| DbError::transaction(format!("Commit failed: {}", e)))
    }

    async fn rollback(&mut self) -> DbResult<()> {
        match self.session.take() {
            Some(mut session) => session
                .abort_transaction()
                .await
                .map_err(|e| DbError::transaction(format!("Rollback failed: {}", e))),
            None => match &self.start_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
        }
    }
}

/// Build a `mongodb://` URI from the structured config.
fn connection_uri(config: &ConnectionConfig) -> DbResult<Url> {
    let invalid = |e: String| DbError::invalid_input(format!("Invalid MongoDB target: {}", e));

    let scheme = if config.options.get("srv").is_some_and(|v| v == "true") {
        "mongodb+srv"
    } else {
        "mongodb"
    };
    let mut url = Url::parse(&format!("{}://{}", scheme, config.host)).map_err(|e| invalid(e.to_string()))?;
    if scheme == "mongodb" {
        url.set_port(config.effective_port())
            .map_err(|_| invalid("cannot set port".to_string()))?;
    }
    if let Some(username) = &config.username {
        url.set_username(username)
            .map_err(|_| invalid("cannot set username".to_string()))?;
        url.set_password(config.password.as_deref())
            .map_err(|_| invalid("cannot set password".to_string()))?;
    }
    url.set_path(&format!("/{}", config.database));

    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &config.options {
            if key != "srv" {
                query.append_pair(key, value);
            }
        }
        match config.tls.mode {
            SslMode::Disable => {
                query.append_pair("tls", "false");
            }
            SslMode::Prefer => {}
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                query.append_pair("tls", "true");
            }
        }
        if config.tls.mode == SslMode::VerifyCa {
            query.append_pair("tlsAllowInvalidHostnames", "true");
        }
        if let Some(ca) = &config.tls.ca_cert_path {
            query.append_pair("tlsCAFile", &ca.to_string_lossy());
        }
        if let Some(cert) = &config.tls.client_cert_path {
            query.append_pair("tlsCertificateKeyFile", &cert.to_string_lossy());
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

/// Parse a JSON command document.
fn parse_command(query: &str) -> DbResult<Document> {
    let value: JsonValue = serde_json::from_str(query).map_err(|e| {
        DbError::invalid_input(format!("MongoDB query must be a JSON command document: {}", e))
    })?;
    if mongo_command_name(&value).is_none() {
        return Err(DbError::invalid_input(
            "MongoDB command document must be a non-empty object",
        ));
    }
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(_) => Err(DbError::invalid_input("MongoDB command must be a document")),
        Err(e) => Err(DbError::invalid_input(format!("Invalid extended JSON: {}", e))),
    }
}

async fn run_command(
    db: &Database,
    session: Option<&mut ClientSession>,
    command: Document,
) -> DbResult<Document> {
    let reply = match session {
        Some(session) => db.run_command(command).session(session).await?,
        None => db.run_command(command).await?,
    };
    Ok(reply)
}

async fn run_with_count(
    db: &Database,
    mut session: Option<&mut ClientSession>,
    command: Document,
    find_count: bool,
    row_limit: u32,
) -> DbResult<QueryResult> {
    let start = Instant::now();
    let count_command = if find_count {
        count_command(&command)
    } else {
        None
    };
    let command = limit_batch(command, row_limit);

    let reply = run_command(db, session.as_deref_mut(), command).await?;
    let mut result = reply_to_result(db, &reply, row_limit).await;

    if let Some((count_command, from_aggregate)) = count_command {
        let reply = run_command(db, session.as_deref_mut(), count_command).await?;
        let count = if from_aggregate {
            first_batch(&reply)
                .and_then(|batch| batch.first())
                .and_then(Bson::as_document)
                .and_then(|d| d.get("count"))
                .and_then(bson_to_u64)
                .unwrap_or(0)
        } else {
            reply.get("n").and_then(bson_to_u64).unwrap_or(0)
        };
        result = result.with_count(count);
    }

    Ok(result.with_execution_time(start.elapsed().as_millis() as u64))
}

/// Cap the first batch at `row_limit + 1` so truncation is detectable.
fn limit_batch(mut command: Document, row_limit: u32) -> Document {
    let batch = i64::from(row_limit) + 1;
    match command.keys().next().map(String::as_str) {
        Some("find") => {
            if !command.contains_key("batchSize") {
                command.insert("batchSize", batch);
            }
        }
        Some("aggregate") => {
            let has_batch = command
                .get_document("cursor")
                .is_ok_and(|c| c.contains_key("batchSize"));
            if !has_batch {
                command.insert("cursor", doc! { "batchSize": batch });
            }
        }
        _ => {}
    }
    command
}

/// Count command for a `find` or `aggregate`, and whether it is an aggregate.
fn count_command(command: &Document) -> Option<(Document, bool)> {
    match command.keys().next().map(String::as_str) {
        Some("find") => {
            let collection = command.get("find")?.clone();
            let filter = command.get_document("filter").cloned().unwrap_or_default();
            Some((doc! { "count": collection, "query": filter }, false))
        }
        Some("aggregate") => {
            let collection = command.get("aggregate")?.clone();
            let mut pipeline = command.get_array("pipeline").cloned().unwrap_or_default();
            pipeline.push(Bson::Document(doc! { "$count": "count" }));
            Some((
                doc! { "aggregate": collection, "pipeline": pipeline, "cursor": {} },
                true,
            ))
        }
        _ => None,
    }
}

fn first_batch(reply: &Document) -> Option<&Vec<Bson>> {
    reply
        .get_document("cursor")
        .ok()
        .and_then(|cursor| cursor.get_array("firstBatch").ok())
}

fn bson_to_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(v) => u64::try_from(*v).ok(),
        Bson::Int64(v) => u64::try_from(*v).ok(),
        Bson::Double(v) if *v >= 0.0 => Some(*v as u64),
        _ => None,
    }
}

async fn reply_to_result(db: &Database, reply: &Document, row_limit: u32) -> QueryResult {
    if let Some(batch) = first_batch(reply) {
        let cursor_id = reply
            .get_document("cursor")
            .ok()
            .and_then(|c| c.get("id"))
            .and_then(|id| id.as_i64())
            .unwrap_or(0);
        let truncated = cursor_id != 0 || batch.len() > row_limit as usize;

        if cursor_id != 0 {
            kill_cursor(db, reply, cursor_id).await;
        }

        let rows: Vec<JsonRow> = batch
            .iter()
            .take(row_limit as usize)
            .map(|doc| match doc.clone().into_relaxed_extjson() {
                JsonValue::Object(map) => map,
                other => {
                    let mut map = JsonRow::new();
                    map.insert("value".to_string(), other);
                    map
                }
            })
            .collect();
        if truncated {
            warn!(limit = row_limit, "Query result truncated");
        }
        let columns = collect_columns(&rows);
        return QueryResult::rows(columns, rows, truncated);
    }

    if let Some(n) = reply.get("n").and_then(bson_to_u64) {
        return QueryResult::affected(n);
    }

    let row = match Bson::Document(reply.clone()).into_relaxed_extjson() {
        JsonValue::Object(map) => map,
        _ => JsonRow::new(),
    };
    let columns = collect_columns(std::slice::from_ref(&row));
    QueryResult::rows(columns, vec![row], false)
}

/// Close a cursor left open by a truncated read. Failures are only logged.
async fn kill_cursor(db: &Database, reply: &Document, cursor_id: i64) {
    let Some(collection) = reply
        .get_document("cursor")
        .ok()
        .and_then(|c| c.get_str("ns").ok())
        .and_then(|ns| ns.split_once('.').map(|(_, coll)| coll.to_string()))
    else {
        return;
    };
    if let Err(e) = db
        .run_command(doc! { "killCursors": collection, "cursors": [cursor_id] })
        .await
    {
        debug!(error = %e, "Failed to kill cursor");
    }
}

/// Union of row keys in order of first appearance.
fn collect_columns(rows: &[JsonRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}
