//! A background job worker for beanstalkd-compatible work queues.
//!
//! Workers reserve messages from one or more queue daemons through a
//! [`pool::ConnectionPool`], run them against handlers registered in a
//! [`registry::HandlerRegistry`] and dispose of each message exactly once:
//! delete on success, release with a delay to retry, bury to quarantine, or
//! drop once the bury budget is spent.
pub mod config;
pub mod connection;
pub mod environment;
pub mod error;
pub mod hooks;
pub mod job;
pub mod line_reader;
pub mod parser;
pub mod pool;
pub mod producer;
pub mod registry;
pub mod types;
pub mod util;
pub mod worker;

#[cfg(test)]
pub(crate) mod fake;
