use std::io;

use thiserror::Error;

use crate::parser::ParsingError;

/// Failures talking to a queue daemon. These are absorbed at the pool/worker
/// boundary and never reach application error handlers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for the queue daemon")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("not found")]
    NotFound,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unparseable response: {0}")]
    Protocol(#[from] ParsingError),
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("undecodable stats: {0}")]
    Stats(#[from] serde_yaml::Error),
}

impl TransportError {
    /// Whether the error says something about the connection rather than the
    /// request, so the request may succeed on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::NotConnected
                | Self::Io(_)
                | Self::Protocol(_)
                | Self::Unexpected(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("no active connection to any endpoint")]
    NoActiveConnection,
    #[error("circuit open: no usable endpoint after {attempts} attempts")]
    CircuitOpen { attempts: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a set of workers stopped.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("worker task crashed: {0}")]
    Crashed(#[from] tokio::task::JoinError),
}

/// Errors raised while constructing or processing a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The message body could not be decoded; the message has been buried.
    #[error("job format invalid: {reason}")]
    FormatInvalid { reason: String },
    /// No handler is registered under the decoded class name.
    #[error("job handler not found: {0}")]
    NotFound(String),
    #[error("{handler} exceeded its {seconds}s time limit")]
    Timeout {
        handler: String,
        seconds: u64,
        trace: String,
    },
    /// Marks an error whose message had already spent its bury budget.
    #[error("{0} (bury limit exceeded, dropped)")]
    Dropped(#[source] Box<JobError>),
    #[error("job already disposed")]
    AlreadyDisposed,
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl JobError {
    /// The execution trace captured with a timeout, looking through
    /// `Dropped`.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Timeout { trace, .. } => Some(trace),
            Self::Dropped(inner) => inner.trace(),
            _ => None,
        }
    }

    /// Returns the error with any `Dropped` annotation removed.
    pub fn original(&self) -> &JobError {
        match self {
            Self::Dropped(inner) => inner.original(),
            other => other,
        }
    }
}
