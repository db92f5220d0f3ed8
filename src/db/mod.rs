//! Database abstraction layer.
//!
//! - [`driver`]: the `Driver`/`Transaction` contracts and the driver registry
//! - [`sql`] and [`mongo`]: the built-in backends
//! - [`pool`]: reference-counted pool entries shared across chat sessions
//! - [`executor`]: a session-bound handle for running statements
//! - [`classify`] and [`types`]: statement classification and row decoding

pub mod classify;
pub mod driver;
pub mod executor;
mod macros;
pub mod mongo;
pub mod pool;
pub mod sql;
pub mod types;

pub use driver::{
    ConnectionHandle, Driver, DriverRegistry, PhysicalConnection, Transaction, downcast_handle,
};
pub use executor::SessionExecutor;
pub use mongo::{MongoConnection, MongoDriver};
pub use pool::{DbPool, PoolEntry};
pub use sql::{SqlConnection, SqlDriver};
