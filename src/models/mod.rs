//! Data models shared by drivers, the manager and the transport.

pub mod connection;
pub mod event;
pub mod query;
pub mod schema;

pub use connection::{
    ConnectionConfig, ConnectionConfigError, ConnectionInfo, ConnectionStatus, DatabaseType,
    SslMode, TlsOptions,
};
pub use event::ConnectionEvent;
pub use query::{
    ExecuteQueryRequest, ExecutionState, ExecutionSummary, JsonRow, QueryError,
    QueryExecutionResult, QueryResult,
};
pub use schema::{
    ColumnChange, ColumnDefinition, SchemaDiff, SchemaSnapshot, SelectedCollections, TableChange,
    TableDefinition,
};
