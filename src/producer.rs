//! Putting jobs on queues.
use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::environment::Environment;
use crate::error::JobError;
use crate::hooks::{Flow, HookContext, HookEvent};
use crate::pool::ConnectionPool;

/// Per-job overrides of the configured defaults.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Queue name, expanded into the namespace. Defaults to the handler's
    /// queue, then the primary queue.
    pub queue: Option<String>,
    pub priority: Option<u32>,
    /// Seconds before the job becomes ready.
    pub delay: u32,
    /// Seconds the worker gets to finish. Defaults to `respond_timeout`.
    pub ttr: Option<u32>,
    /// Trace context handed to the worker that runs the job.
    pub carrier: Option<HashMap<String, String>>,
}

#[derive(Serialize)]
struct Payload<'a> {
    class: &'a str,
    args: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    carrier: Option<&'a HashMap<String, String>>,
}

/// Puts a job for the handler registered as `class`. Returns the new job's
/// ID, or `None` if a `before_enqueue` hook stopped it.
pub async fn enqueue(
    env: &Environment,
    pool: &mut ConnectionPool,
    class: &str,
    args: &[Value],
    options: EnqueueOptions,
) -> Result<Option<u64>, JobError> {
    let handler = env.registry.resolve(class)?;
    let config = &env.config;

    let ctx = HookContext::new(HookEvent::BeforeEnqueue, class, args);
    if env.hooks.run(&ctx)? == Flow::Stop {
        debug!(job = class, "stopped by before_enqueue hook");
        return Ok(None);
    }

    let queue = options
        .queue
        .as_deref()
        .or(handler.queue())
        .unwrap_or(&config.primary_queue);
    let tube = config.expand_tube_name(queue);

    let body = serde_json::to_vec(&Payload {
        class,
        args,
        carrier: options.carrier.as_ref(),
    })
    .map_err(|e| JobError::FormatInvalid {
        reason: e.to_string(),
    })?;
    let body = Bytes::from(body);

    let pri = options.priority.unwrap_or(config.default_priority);
    let ttr = options.ttr.unwrap_or(config.respond_timeout);
    let delay = options.delay;

    let put_tube = tube.clone();
    let id = pool
        .retryable(move |conn| {
            let tube = put_tube.clone();
            let body = body.clone();
            Box::pin(async move {
                conn.put(&tube, body, pri, delay, ttr).await
            })
        })
        .await?;

    info!(id, job = class, %tube, "enqueued job");

    let ctx = HookContext::new(HookEvent::AfterEnqueue, class, args);
    env.hooks.run(&ctx)?;

    Ok(Some(id))
}
