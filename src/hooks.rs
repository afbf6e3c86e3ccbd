//! Lifecycle hooks.
//!
//! Callbacks are registered against a [`HookEvent`] and run synchronously, in
//! registration order, with a [`HookContext`] naming the handler and its
//! arguments. `around_perform` hooks are async and nest around the handler
//! call, the first registered outermost.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::error::JobError;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HookEvent {
    BeforeEnqueue,
    AfterEnqueue,
    BeforePerform,
    /// Carried by the context handed to [`AroundPerform`] hooks; register
    /// those with [`Hooks::around`].
    AroundPerform,
    AfterPerform,
    OnFailure,
    OnRetry,
    OnBury,
    OnDrop,
    OnReconnect,
}

/// Whether a `before_*` hook lets the operation go ahead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Event-specific data passed alongside the handler and arguments.
#[derive(Clone, Copy, Debug)]
pub enum HookDetail<'a> {
    None,
    Error(&'a JobError),
    Retry { attempt: u64, delay: u64 },
    /// The endpoint a pool reconnected to.
    Endpoint(&'a str),
}

#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    pub event: HookEvent,
    pub handler: &'a str,
    pub args: &'a [Value],
    pub detail: HookDetail<'a>,
}

impl<'a> HookContext<'a> {
    pub fn new(event: HookEvent, handler: &'a str, args: &'a [Value]) -> Self {
        Self {
            event,
            handler,
            args,
            detail: HookDetail::None,
        }
    }

    pub fn with_detail(mut self, detail: HookDetail<'a>) -> Self {
        self.detail = detail;
        self
    }
}

pub type Hook =
    Arc<dyn Fn(&HookContext<'_>) -> anyhow::Result<Flow> + Send + Sync>;

/// The rest of the around chain, ending in the handler call.
pub type Next<'a> = BoxFuture<'a, Result<(), JobError>>;

/// A hook wrapping handler execution. Implementations must await `next`
/// exactly once to run the handler, or return without awaiting it to skip it.
#[async_trait]
pub trait AroundPerform: Send + Sync {
    async fn around<'a>(
        &'a self,
        ctx: &'a HookContext<'a>,
        next: Next<'a>,
    ) -> Result<(), JobError>;
}

#[derive(Clone, Default)]
pub struct Hooks {
    callbacks: HashMap<HookEvent, Vec<Hook>>,
    around: Vec<Arc<dyn AroundPerform>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hook` to run on `event`.
    pub fn on<F>(&mut self, event: HookEvent, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<Flow> + Send + Sync + 'static,
    {
        self.callbacks.entry(event).or_default().push(Arc::new(hook));
        self
    }

    pub fn around(&mut self, hook: impl AroundPerform + 'static) -> &mut Self {
        self.around.push(Arc::new(hook));
        self
    }

    /// Runs every callback for `ctx.event`. The result is `Stop` if any
    /// callback asked to stop; the first error ends the run.
    pub fn run(&self, ctx: &HookContext<'_>) -> Result<Flow, JobError> {
        let mut flow = Flow::Continue;

        for hook in self.callbacks.get(&ctx.event).into_iter().flatten() {
            if hook(ctx)? == Flow::Stop {
                flow = Flow::Stop;
            }
        }

        Ok(flow)
    }

    /// Runs every callback for `ctx.event`, logging and discarding errors.
    /// Used on failure paths, where a hook error must not mask the original.
    pub fn notify(&self, ctx: &HookContext<'_>) {
        for hook in self.callbacks.get(&ctx.event).into_iter().flatten() {
            if let Err(error) = hook(ctx) {
                warn!(
                    event = ?ctx.event,
                    handler = ctx.handler,
                    %error,
                    "hook failed"
                );
            }
        }
    }

    /// Wraps `inner` in every registered around hook.
    pub fn wrap_around<'a>(
        &'a self,
        ctx: &'a HookContext<'a>,
        inner: Next<'a>,
    ) -> Next<'a> {
        self.around
            .iter()
            .rev()
            .fold(inner, |next, hook| hook.around(ctx, next))
    }
}
