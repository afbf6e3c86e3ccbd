//! Maps handler names found in job payloads to the code that runs them.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobError;

/// Something a job can be dispatched to.
#[async_trait]
pub trait Performable: Send + Sync {
    /// Runs the job with its positional arguments.
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()>;

    /// The queue this handler's jobs are put on, if not the primary queue.
    fn queue(&self) -> Option<&str> {
        None
    }
}

/// Handlers keyed by the `class` name jobs are enqueued under.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Performable>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Performable + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Looks up the handler for `name`.
    pub fn resolve(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Performable>, JobError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::NotFound(name.to_owned()))
    }

    /// Queue names declared by registered handlers, sorted and deduplicated.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .values()
            .filter_map(|h| h.queue().map(str::to_owned))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
