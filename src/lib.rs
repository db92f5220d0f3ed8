//! Chat-scoped database session orchestrator.
//!
//! Chats attach at runtime to PostgreSQL, MySQL, SQLite or MongoDB backends.
//! Sessions that resolve to the same backend share one reference-counted
//! pool, queries run inside cancellable, deadline-bounded transactions, and
//! connection status and schema drift are pushed to subscribed streams.

pub mod config;
pub mod db;
pub mod error;
pub mod liveness;
pub mod manager;
pub mod models;
pub mod schema;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use error::DbError;
pub use manager::Manager;
