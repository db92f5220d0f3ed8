//! Query-related data models.
//!
//! Requests carry the chat/stream correlation ids alongside the statement.
//! Results always carry an execution time, whether they hold rows or an error.

use crate::error::{DbError, ErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type JsonRow = serde_json::Map<String, JsonValue>;

/// Rows (or an affected-row count) produced by one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<JsonRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// Total matching rows when `find_count` was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// More rows existed than the row limit allowed
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn rows(columns: Vec<String>, rows: Vec<JsonRow>, truncated: bool) -> Self {
        Self {
            columns,
            rows,
            truncated,
            ..Default::default()
        }
    }

    /// Result of a write or DDL statement.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Serialized error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&DbError> for QueryError {
    fn from(err: &DbError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

/// Outcome of an execution as delivered to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    pub execution_time_ms: u64,
}

impl QueryExecutionResult {
    pub fn success(result: QueryResult, execution_time_ms: u64) -> Self {
        Self {
            result: Some(result.with_execution_time(execution_time_ms)),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failure(err: &DbError, execution_time_ms: u64) -> Self {
        Self {
            result: None,
            error: Some(QueryError::from(err)),
            execution_time_ms,
        }
    }

    /// Statement-level failure: the backend message passes through under
    /// `EXECUTION_ERROR` whatever the underlying variant was.
    pub fn statement_failure(err: &DbError, execution_time_ms: u64) -> Self {
        Self {
            result: None,
            error: Some(QueryError {
                code: ErrorCode::ExecutionError,
                message: err.to_string(),
                details: err.details(),
            }),
            execution_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// A user-issued query bound to a chat session and a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteQueryRequest {
    pub chat_id: String,
    /// Correlates cancellation with the issuing client
    pub stream_id: String,
    #[serde(default)]
    pub query_id: String,
    #[serde(default)]
    pub message_id: String,
    pub query: String,
    /// Caller's classification hint, e.g. `SELECT` or `find`
    #[serde(default)]
    pub query_type: Option<String>,
    /// Dry run: roll back instead of committing
    #[serde(default)]
    pub is_rollback: bool,
    #[serde(default)]
    pub find_count: bool,
    /// Capped by the manager's execution ceiling
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExecuteQueryRequest {
    pub fn new(
        chat_id: impl Into<String>,
        stream_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            stream_id: stream_id.into(),
            query_id: String::new(),
            message_id: String::new(),
            query: query.into(),
            query_type: None,
            is_rollback: false,
            find_count: false,
            timeout_ms: None,
        }
    }

    pub fn with_ids(mut self, query_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self.message_id = message_id.into();
        self
    }

    pub fn with_query_type(mut self, query_type: impl Into<String>) -> Self {
        self.query_type = Some(query_type.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.is_rollback = true;
        self
    }

    pub fn with_find_count(mut self) -> Self {
        self.find_count = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Lifecycle state of a tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Executing,
    Committed,
    RolledBack,
    Cancelled,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Executing)
    }
}

/// In-flight execution, as listed by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub stream_id: String,
    pub chat_id: String,
    pub query_id: String,
    pub message_id: String,
    pub started_at: DateTime<Utc>,
    pub state: ExecutionState,
}
