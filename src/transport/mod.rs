//! Transport layer.
//!
//! A transport moves commands from clients into the [`Manager`] and pushes
//! responses and stream events back out. The only built-in transport speaks
//! newline-delimited JSON over stdio.
//!
//! [`Manager`]: crate::manager::Manager

pub mod stdio;

pub use stdio::{Command, Request, Response, StdioTransport, serve};

use crate::error::DbResult;
use std::future::Future;

pub trait Transport: Send + Sync {
    /// Serve until the input closes or a shutdown signal arrives.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}
