//! Everything a worker shares across jobs: configuration, handlers, hooks,
//! and the user callbacks consulted when a job fails.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

use crate::config::Configuration;
use crate::error::JobError;
use crate::hooks::Hooks;
use crate::registry::HandlerRegistry;
use crate::types::message::RawMessage;

/// Computes the release delay, in seconds, from the configured base delay
/// and the 1-based attempt number.
pub type RetryDelayFn =
    Arc<dyn Fn(u64, u64) -> anyhow::Result<u64> + Send + Sync>;

type ErrorOnly = dyn Fn(&JobError) -> anyhow::Result<()> + Send + Sync;
type ErrorAndJob =
    dyn Fn(&JobError, &str, &[Value]) -> anyhow::Result<()> + Send + Sync;
type ErrorJobAndMessage =
    dyn Fn(&JobError, &str, &[Value], &RawMessage) -> anyhow::Result<()>
        + Send
        + Sync;

/// Called with every non-transport job failure. Handlers take as much
/// context as they want.
#[derive(Clone)]
pub enum ErrorHandler {
    Error(Arc<ErrorOnly>),
    ErrorAndJob(Arc<ErrorAndJob>),
    ErrorJobAndMessage(Arc<ErrorJobAndMessage>),
}

impl ErrorHandler {
    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&JobError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Error(Arc::new(f))
    }

    pub fn error_and_job<F>(f: F) -> Self
    where
        F: Fn(&JobError, &str, &[Value]) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::ErrorAndJob(Arc::new(f))
    }

    pub fn error_job_and_message<F>(f: F) -> Self
    where
        F: Fn(&JobError, &str, &[Value], &RawMessage) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::ErrorJobAndMessage(Arc::new(f))
    }

    fn call(
        &self,
        error: &JobError,
        handler: &str,
        args: &[Value],
        message: &RawMessage,
    ) -> anyhow::Result<()> {
        match self {
            Self::Error(f) => f(error),
            Self::ErrorAndJob(f) => f(error, handler, args),
            Self::ErrorJobAndMessage(f) => f(error, handler, args, message),
        }
    }
}

/// The default retry delay: the base plus the cube of the attempt number.
pub fn cubic_backoff(base: u64, attempt: u64) -> anyhow::Result<u64> {
    Ok(base.saturating_add(attempt.saturating_pow(3)))
}

pub struct Environment {
    pub config: Configuration,
    pub registry: HandlerRegistry,
    pub hooks: Hooks,
    retry_delay: RetryDelayFn,
    on_error: Option<ErrorHandler>,
}

impl Environment {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            hooks: Hooks::new(),
            retry_delay: Arc::new(cubic_backoff),
            on_error: None,
        }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_retry_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, u64) -> anyhow::Result<u64> + Send + Sync + 'static,
    {
        self.retry_delay = Arc::new(f);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// The delay before retry `attempt`. Falls back to the base delay when
    /// the delay function fails or panics.
    pub fn retry_delay_for(&self, attempt: u64) -> u64 {
        let base = self.config.retry_delay;
        let f = &self.retry_delay;

        match catch_unwind(AssertUnwindSafe(|| f(base, attempt))) {
            Ok(Ok(delay)) => delay,
            Ok(Err(error)) => {
                warn!(attempt, %error, "retry delay function failed");
                base
            },
            Err(_) => {
                warn!(attempt, "retry delay function panicked");
                base
            },
        }
    }

    /// Hands a job failure to the error handler, if any. Nothing the handler
    /// does escapes this call.
    pub fn report_error(
        &self,
        job_error: &JobError,
        handler: &str,
        args: &[Value],
        message: &RawMessage,
    ) {
        let Some(on_error) = &self.on_error else {
            return;
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            on_error.call(job_error, handler, args, message)
        }));

        match result {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                error!(handler, %error, "job error handler failed");
            },
            Err(_) => error!(handler, "job error handler panicked"),
        }
    }
}
