//! Error types for the orchestrator.
//!
//! Every lifecycle failure surfaces as a [`DbError`]. Each variant maps onto a
//! stable [`ErrorCode`] that callers see in serialized results, so the wire
//! contract does not depend on the Rust variant names.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serialized error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionError,
    ConnectionExists,
    NoDriverFound,
    FailedToStartTransaction,
    QueryExecutionTimedOut,
    QueryExecutionCancelled,
    QueryExecutionFailed,
    ExecutionError,
    PermissionDenied,
    InvalidInput,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionExists => "CONNECTION_EXISTS",
            Self::NoDriverFound => "NO_DRIVER_FOUND",
            Self::FailedToStartTransaction => "FAILED_TO_START_TRANSACTION",
            Self::QueryExecutionTimedOut => "QUERY_EXECUTION_TIMED_OUT",
            Self::QueryExecutionCancelled => "QUERY_EXECUTION_CANCELLED",
            Self::QueryExecutionFailed => "QUERY_EXECUTION_FAILED",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator error.
///
/// `Clone` so a transaction that failed to start can hand its stored error
/// back on every later call.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection already exists for chat '{chat_id}'")]
    ConnectionExists { chat_id: String },

    #[error("Connection not found for chat '{chat_id}'")]
    ConnectionNotFound { chat_id: String },

    #[error("No driver registered for database type '{db_type}'")]
    NoDriverFound { db_type: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE for SQL backends, the command error name for MongoDB
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Failed to start transaction: {message}")]
    TransactionStart { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Query execution cancelled for stream '{stream_id}'")]
    Cancelled { stream_id: String },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn connection_exists(chat_id: impl Into<String>) -> Self {
        Self::ConnectionExists {
            chat_id: chat_id.into(),
        }
    }

    pub fn connection_not_found(chat_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            chat_id: chat_id.into(),
        }
    }

    pub fn no_driver(db_type: impl std::fmt::Display) -> Self {
        Self::NoDriverFound {
            db_type: db_type.to_string(),
        }
    }

    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn transaction_start(message: impl Into<String>) -> Self {
        Self::TransactionStart {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn cancelled(stream_id: impl Into<String>) -> Self {
        Self::Cancelled {
            stream_id: stream_id.into(),
        }
    }

    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable code reported to callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection { .. } | Self::ConnectionNotFound { .. } => ErrorCode::ConnectionError,
            Self::ConnectionExists { .. } => ErrorCode::ConnectionExists,
            Self::NoDriverFound { .. } => ErrorCode::NoDriverFound,
            Self::Database { .. } | Self::Schema { .. } => ErrorCode::ExecutionError,
            Self::TransactionStart { .. } => ErrorCode::FailedToStartTransaction,
            Self::Transaction { .. } => ErrorCode::QueryExecutionFailed,
            Self::Timeout { .. } => ErrorCode::QueryExecutionTimedOut,
            Self::Cancelled { .. } => ErrorCode::QueryExecutionCancelled,
            Self::Permission { .. } => ErrorCode::PermissionDenied,
            Self::InvalidInput { .. } => ErrorCode::InvalidInput,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Extra context carried in the `details` field of a serialized error.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::Database {
                sql_state: Some(state),
                suggestion,
                ..
            } => Some(format!("{} (code: {})", suggestion, state)),
            _ => self.suggestion().map(String::from),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the statement syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a pooled connection",
                "The backend is saturated or unreachable; retry later",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect the chat session")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS mode and certificate paths",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match err.kind.as_ref() {
            ErrorKind::Command(cmd) => DbError::database(
                cmd.message.clone(),
                Some(cmd.code_name.clone()),
                "Check the command document and referenced collections",
            ),
            ErrorKind::Authentication { .. } => DbError::connection(
                err.to_string(),
                "Check the username, password and authSource",
            ),
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
                DbError::connection(
                    err.to_string(),
                    "Check network connectivity and database server status",
                )
            }
            ErrorKind::InvalidArgument { .. } => DbError::invalid_input(err.to_string()),
            ErrorKind::Transaction { .. } => DbError::transaction(err.to_string()),
            _ => DbError::database(err.to_string(), None, "Check the command document"),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
