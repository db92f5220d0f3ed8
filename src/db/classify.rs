//! Statement classification.
//!
//! SQL text is parsed with [sqlparser](https://docs.rs/sqlparser/) using the
//! backend's dialect. The class decides how a statement is executed (stream
//! rows or report rows affected) and whether a commit must trigger a schema
//! re-check. MongoDB commands are classified by their command name.

use crate::models::DatabaseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStatementType {
    /// SELECT, SHOW, DESCRIBE, EXPLAIN of a read, VALUES
    Select,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    DmlWrite,
    /// CREATE, DROP, ALTER, TRUNCATE, RENAME, COMMENT
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// CALL, EXECUTE, PREPARE
    ProcedureCall,
    /// GRANT, SET, PRAGMA, VACUUM, ...
    Administrative,
    Unknown,
}

impl SqlStatementType {
    pub fn returns_rows(&self) -> bool {
        matches!(self, Self::Select)
    }
}

fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
        _ => Box::new(PostgreSqlDialect {}),
    }
}

/// Classify every statement in `sql`.
///
/// Text the parser rejects falls back to keyword inspection so that
/// backend-specific syntax still executes.
pub fn classify_sql(sql: &str, db_type: DatabaseType) -> Vec<SqlStatementType> {
    let dialect = get_dialect(db_type);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) if !statements.is_empty() => {
            statements.iter().map(classify_statement).collect()
        }
        _ => vec![classify_by_keyword(sql)],
    }
}

/// Combined class of a (possibly multi-statement) query: a read only when
/// every statement reads, DDL when any statement is DDL.
pub fn sql_query_kind(sql: &str, db_type: DatabaseType, query_type: Option<&str>) -> SqlStatementType {
    let kinds = classify_sql(sql, db_type);
    if kinds.iter().any(|k| *k == SqlStatementType::Ddl) {
        return SqlStatementType::Ddl;
    }
    if kinds.iter().all(|k| k.returns_rows()) {
        return SqlStatementType::Select;
    }
    if let Some(first) = kinds.iter().find(|k| **k != SqlStatementType::Unknown) {
        return *first;
    }
    query_type
        .map(classify_by_keyword)
        .unwrap_or(SqlStatementType::Unknown)
}

/// True when the SQL text contains a DDL statement.
pub fn is_sql_schema_mutation(sql: &str, db_type: DatabaseType, query_type: Option<&str>) -> bool {
    if classify_sql(sql, db_type).contains(&SqlStatementType::Ddl) {
        return true;
    }
    query_type.is_some_and(|hint| classify_by_keyword(hint) == SqlStatementType::Ddl)
}

fn classify_by_keyword(sql: &str) -> SqlStatementType {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE" => {
            SqlStatementType::Select
        }
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT" | "COPY" => {
            SqlStatementType::DmlWrite
        }
        "CREATE" | "DROP" | "ALTER" | "TRUNCATE" | "RENAME" | "COMMENT" => SqlStatementType::Ddl,
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
            SqlStatementType::Transaction
        }
        "CALL" | "EXEC" | "EXECUTE" | "PREPARE" => SqlStatementType::ProcedureCall,
        "GRANT" | "REVOKE" | "SET" | "PRAGMA" | "VACUUM" | "ANALYZE" | "LOCK" | "UNLOCK" | "USE" => {
            SqlStatementType::Administrative
        }
        _ => SqlStatementType::Unknown,
    }
}

fn classify_statement(stmt: &Statement) -> SqlStatementType {
    match stmt {
        Statement::Query(_)
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => SqlStatementType::Select,

        // EXPLAIN returns rows even for writes; ANALYZE variants still run the
        // inner statement, so keep its class when it is not a read.
        Statement::Explain { statement, .. } => match classify_statement(statement) {
            SqlStatementType::Ddl => SqlStatementType::Ddl,
            _ => SqlStatementType::Select,
        },

        Statement::Insert(_)
        | Statement::Update { .. }
        | Statement::Delete(_)
        | Statement::Merge { .. }
        | Statement::Copy { .. } => SqlStatementType::DmlWrite,

        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateTrigger { .. }
        | Statement::CreateVirtualTable { .. }
        | Statement::CreateExtension { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterSchema { .. }
        | Statement::AlterType { .. }
        | Statement::Drop { .. }
        | Statement::DropFunction { .. }
        | Statement::DropProcedure { .. }
        | Statement::DropTrigger { .. }
        | Statement::Truncate { .. }
        | Statement::Comment { .. } => SqlStatementType::Ddl,

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => SqlStatementType::Transaction,

        Statement::Call { .. }
        | Statement::Execute { .. }
        | Statement::Prepare { .. }
        | Statement::Deallocate { .. } => SqlStatementType::ProcedureCall,

        Statement::Grant { .. }
        | Statement::Revoke { .. }
        | Statement::Set(_)
        | Statement::Use(_)
        | Statement::Kill { .. }
        | Statement::Vacuum { .. }
        | Statement::Analyze { .. }
        | Statement::LockTables { .. }
        | Statement::UnlockTables
        | Statement::Pragma { .. } => SqlStatementType::Administrative,

        _ => SqlStatementType::Unknown,
    }
}

/// MongoDB commands that change collections or indexes.
const MONGO_SCHEMA_COMMANDS: &[&str] = &[
    "create",
    "createcollection",
    "drop",
    "dropcollection",
    "dropdatabase",
    "renamecollection",
    "createindexes",
    "createindex",
    "dropindexes",
    "dropindex",
    "collmod",
    "createview",
];

/// MongoDB commands a multi-document transaction refuses to run.
const MONGO_NON_TRANSACTIONAL: &[&str] = &[
    "drop",
    "dropdatabase",
    "renamecollection",
    "dropindexes",
    "collmod",
    "listcollections",
    "listindexes",
    "count",
    "ping",
    "buildinfo",
    "serverstatus",
    "dbstats",
    "collstats",
];

/// Name of a command document: its first key.
pub fn mongo_command_name(command: &serde_json::Value) -> Option<&str> {
    command.as_object()?.keys().next().map(String::as_str)
}

pub fn is_mongo_schema_mutation(query: &str, query_type: Option<&str>) -> bool {
    let parsed: Option<serde_json::Value> = serde_json::from_str(query).ok();
    let name = parsed.as_ref().and_then(mongo_command_name).or(query_type);
    name.is_some_and(|n| MONGO_SCHEMA_COMMANDS.contains(&n.to_ascii_lowercase().as_str()))
}

pub fn mongo_runs_outside_transaction(command_name: &str) -> bool {
    MONGO_NON_TRANSACTIONAL.contains(&command_name.to_ascii_lowercase().as_str())
}
