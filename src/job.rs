//! A reserved message decoded into a handler call.
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::connection::Connection;
use crate::environment::Environment;
use crate::error::{JobError, TransportError};
use crate::hooks::{Flow, HookContext, HookDetail, HookEvent};
use crate::registry::Performable;
use crate::types::message::RawMessage;
use crate::types::protocol::JobStats;

/// How a successfully processed job ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Processed {
    /// The handler ran and the message was deleted.
    Completed,
    /// A hook stopped the job, or its message vanished before it ran. The
    /// message is left as it is.
    Skipped,
}

#[derive(Debug, Deserialize)]
struct Payload {
    class: String,
    args: Vec<Value>,
    #[serde(default)]
    carrier: Option<HashMap<String, String>>,
}

/// Decodes a message body into its payload. Only JSON objects with a string
/// `class` and an array `args` are accepted.
fn decode(body: &[u8]) -> Result<Payload, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| e.to_string())?;

    if !value.is_object() {
        return Err("payload is not an object".to_owned());
    }

    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// The time a handler gets for a job with the given ttr: none for a zero
/// ttr, otherwise one second less than the ttr so the message can still be
/// disposed of before the daemon reclaims it, but never below one second.
pub fn timeout_bound(ttr: u32) -> Option<Duration> {
    match ttr {
        0 => None,
        1 => Some(Duration::from_secs(1)),
        n => Some(Duration::from_secs(u64::from(n) - 1)),
    }
}

/// One reserved message and the connection it was reserved on.
///
/// A job is disposed of (deleted, released or buried) at most once; any
/// second attempt fails with [`JobError::AlreadyDisposed`] without reaching
/// the daemon.
pub struct Job<'c> {
    env: &'c Environment,
    conn: &'c mut dyn Connection,
    message: RawMessage,
    name: String,
    args: Vec<Value>,
    carrier: Option<HashMap<String, String>>,
    /// Priority reported by the last stats lookup, reused on disposal.
    priority: u32,
    disposed: bool,
}

impl<'c> Job<'c> {
    /// Decodes `message`. A message that can't be decoded is buried on the
    /// spot, since no retry would fix it.
    pub async fn new(
        env: &'c Environment,
        conn: &'c mut dyn Connection,
        message: RawMessage,
    ) -> Result<Job<'c>, JobError> {
        let payload = match decode(&message.body) {
            Ok(payload) => payload,
            Err(reason) => {
                let pri = match conn.stats(message.id).await {
                    Ok(stats) => stats.pri,
                    Err(_) => env.config.default_priority,
                };

                if let Err(error) = conn.bury(message.id, pri).await {
                    warn!(id = message.id, %error, "burying invalid job");
                }

                return Err(JobError::FormatInvalid { reason });
            },
        };

        Ok(Job {
            env,
            conn,
            name: payload.class,
            args: payload.args,
            carrier: payload.carrier,
            priority: env.config.default_priority,
            message,
            disposed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn message(&self) -> &RawMessage {
        &self.message
    }

    /// Trace context propagated from the producer.
    pub fn carrier(&self) -> Option<&HashMap<String, String>> {
        self.carrier.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn context(&self, event: HookEvent) -> HookContext<'_> {
        HookContext::new(event, &self.name, &self.args)
    }

    /// Runs the handler under the job's hooks and deletes the message on
    /// success. Failures other than transport errors run the `on_failure`
    /// hooks before being returned; disposing of a failed job is up to the
    /// caller.
    pub async fn process(&mut self) -> Result<Processed, JobError> {
        let span = match &self.carrier {
            Some(carrier) => info_span!(
                "job",
                handler = %self.name,
                traceparent = carrier.get("traceparent").map(String::as_str),
                tracestate = carrier.get("tracestate").map(String::as_str),
            ),
            None => Span::none(),
        };

        let result = self.run().instrument(span).await;

        if let Err(error) = &result {
            if !matches!(error, JobError::Transport(_)) {
                let ctx = self
                    .context(HookEvent::OnFailure)
                    .with_detail(HookDetail::Error(error));
                self.env.hooks.notify(&ctx);
            }
        }

        result
    }

    async fn run(&mut self) -> Result<Processed, JobError> {
        let env = self.env;
        let handler = env.registry.resolve(&self.name)?;

        if env.hooks.run(&self.context(HookEvent::BeforePerform))?
            == Flow::Stop
        {
            debug!(handler = %self.name, "stopped by before_perform hook");
            return Ok(Processed::Skipped);
        }

        // The daemon's ttr is authoritative, and a missing message means
        // someone else already dealt with it.
        let ttr = match self.stats().await {
            Ok(stats) => stats.ttr,
            Err(JobError::Transport(TransportError::NotFound)) => {
                debug!(id = self.message.id, "job vanished before running");
                return Ok(Processed::Skipped);
            },
            Err(error) => return Err(error),
        };

        {
            let ctx = self.context(HookEvent::AroundPerform);
            let inner = Box::pin(perform_within(
                handler.as_ref(),
                &self.name,
                &self.args,
                timeout_bound(ttr),
            ));
            env.hooks.wrap_around(&ctx, inner).await?;
        }

        self.delete().await?;
        env.hooks.run(&self.context(HookEvent::AfterPerform))?;

        Ok(Processed::Completed)
    }

    /// Fetches the message's daemon-side stats, remembering its priority.
    pub async fn stats(&mut self) -> Result<JobStats, JobError> {
        let stats = self.conn.stats(self.message.id).await?;
        self.priority = stats.pri;
        Ok(stats)
    }

    /// Marks the job disposed. The mark is set before the daemon is asked, so
    /// a failed disposal still counts as the one attempt.
    fn take_disposal(&mut self) -> Result<(), JobError> {
        if self.disposed {
            return Err(JobError::AlreadyDisposed);
        }
        self.disposed = true;
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<(), JobError> {
        self.take_disposal()?;
        self.conn.delete(self.message.id).await?;
        Ok(())
    }

    /// Releases the message to run again after `delay` seconds.
    pub async fn retry(
        &mut self,
        attempt: u64,
        delay: u64,
    ) -> Result<(), JobError> {
        self.take_disposal()?;

        let ctx = self
            .context(HookEvent::OnRetry)
            .with_detail(HookDetail::Retry { attempt, delay });
        self.env.hooks.notify(&ctx);

        let delay = u32::try_from(delay).unwrap_or(u32::MAX);
        self.conn
            .release(self.message.id, self.priority, delay)
            .await?;
        Ok(())
    }

    pub async fn bury(&mut self) -> Result<(), JobError> {
        self.take_disposal()?;

        self.env.hooks.notify(&self.context(HookEvent::OnBury));

        self.conn.bury(self.message.id, self.priority).await?;
        Ok(())
    }

    /// Deletes a message that has failed past its bury budget.
    pub async fn drop_job(&mut self, error: &JobError) -> Result<(), JobError> {
        self.take_disposal()?;

        let ctx = self
            .context(HookEvent::OnDrop)
            .with_detail(HookDetail::Error(error));
        self.env.hooks.notify(&ctx);

        self.conn.delete(self.message.id).await?;
        Ok(())
    }
}

/// Calls the handler, failing with a timeout error if it outlives `bound`.
async fn perform_within(
    handler: &dyn Performable,
    name: &str,
    args: &[Value],
    bound: Option<Duration>,
) -> Result<(), JobError> {
    let Some(bound) = bound else {
        return perform_guarded(handler, name, args).await;
    };

    match tokio::time::timeout(bound, perform_guarded(handler, name, args))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout {
            handler: name.to_owned(),
            seconds: bound.as_secs(),
            trace: Backtrace::force_capture().to_string(),
        }),
    }
}

/// Runs the handler, turning a panic into a handler error.
async fn perform_guarded(
    handler: &dyn Performable,
    name: &str,
    args: &[Value],
) -> Result<(), JobError> {
    match AssertUnwindSafe(handler.perform(args)).catch_unwind().await {
        Ok(result) => Ok(result?),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_owned());
            Err(JobError::Handler(anyhow!("{name} panicked: {reason}")))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::Configuration;
    use crate::fake::{
        recording_hooks, Call, Echo, FakeDaemon, Failing, Panicky, Sleepy,
    };
    use crate::hooks::{AroundPerform, Hooks, Next};
    use crate::registry::HandlerRegistry;

    struct Around(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl AroundPerform for Around {
        async fn around<'a>(
            &'a self,
            ctx: &'a HookContext<'a>,
            next: Next<'a>,
        ) -> Result<(), JobError> {
            self.0.lock().unwrap().push(format!("enter:{}", ctx.handler));
            let result = next.await;
            self.0.lock().unwrap().push(format!("exit:{}", ctx.handler));
            result
        }
    }

    fn env_with(registry: HandlerRegistry, hooks: Hooks) -> Environment {
        Environment::new(Configuration::default())
            .with_registry(registry)
            .with_hooks(hooks)
    }

    fn echo_env(echo: &Echo) -> Environment {
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", echo.clone());
        env_with(registry, Hooks::new())
    }

    #[tokio::test]
    async fn test_echo_completes_and_deletes() {
        let daemon = FakeDaemon::new();
        let id = daemon.push(r#"{"class":"Echo","args":["hi",2]}"#, 10);
        let echo = Echo::default();
        let env = echo_env(&echo);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        assert_eq!(job.name(), "Echo");
        assert_eq!(job.process().await.unwrap(), Processed::Completed);
        assert!(job.is_disposed());

        assert_eq!(echo.performed(), [vec![Value::from("hi"), Value::from(2)]]);
        assert_eq!(daemon.dispositions(), [Call::Delete(id)]);
        assert_eq!(daemon.stats(id), None);
    }

    #[tokio::test]
    async fn test_hook_order() {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Echo","args":[]}"#, 10);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = recording_hooks(log.clone());
        hooks.around(Around(log.clone()));
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", Echo::default());
        let env = env_with(registry, hooks);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();
        job.process().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            [
                "BeforePerform:Echo",
                "enter:Echo",
                "exit:Echo",
                "AfterPerform:Echo"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Missing","args":[]}"#, 10);

        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = recording_hooks(log.clone());
        let env = env_with(HandlerRegistry::new(), hooks);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        match job.process().await {
            Err(JobError::NotFound(name)) => assert_eq!(name, "Missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!job.is_disposed());
        assert!(daemon.dispositions().is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            ["OnFailure:Missing:job handler not found: Missing"]
        );
    }

    #[tokio::test]
    async fn test_handler_error_runs_failure_hooks() {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Failing","args":[]}"#, 10);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("Failing", Failing);
        let env = env_with(registry, recording_hooks(log.clone()));

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        let err = job.process().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(
            *log.lock().unwrap(),
            ["BeforePerform:Failing", "OnFailure:Failing:boom"]
        );
        assert!(daemon.dispositions().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Panicky","args":[]}"#, 10);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("Panicky", Panicky);
        let env = env_with(registry, recording_hooks(log.clone()));

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        let err = job.process().await.unwrap_err();
        assert!(matches!(err, JobError::Handler(_)));
        assert_eq!(err.to_string(), "Panicky panicked: kaboom");
        assert_eq!(
            log.lock().unwrap().last().map(String::as_str),
            Some("OnFailure:Panicky:Panicky panicked: kaboom")
        );
        assert!(!job.is_disposed());
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_buried() {
        let daemon = FakeDaemon::new();
        let env = Environment::new(Configuration::default());

        for body in [
            "not json",
            r#"["Echo", []]"#,
            r#"{"class": 1, "args": []}"#,
            r#"{"class": "Echo"}"#,
            r#"{"class": "Echo", "args": "hi"}"#,
        ] {
            let id = daemon.push(body, 10);
            let mut conn = daemon.connection("a");
            let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();

            match Job::new(&env, &mut conn, message).await {
                Err(JobError::FormatInvalid { .. }) => {},
                Err(other) => panic!("{body}: unexpected error {other}"),
                Ok(_) => panic!("{body}: decoded"),
            }

            // Buried with the priority the daemon reported.
            assert_eq!(
                daemon.dispositions().last(),
                Some(&Call::Bury { id, pri: 100 })
            );
        }
    }

    #[tokio::test]
    async fn test_carrier_is_decoded() {
        let daemon = FakeDaemon::new();
        daemon.push(
            r#"{"class":"Echo","args":[],"carrier":{"traceparent":"00-ab"}}"#,
            10,
        );
        let echo = Echo::default();
        let env = echo_env(&echo);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        let carrier = job.carrier().unwrap();
        assert_eq!(carrier["traceparent"], "00-ab");
        assert_eq!(job.process().await.unwrap(), Processed::Completed);
    }

    #[tokio::test]
    async fn test_before_hook_stops_job() {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Echo","args":[]}"#, 10);

        let mut hooks = Hooks::new();
        hooks.on(HookEvent::BeforePerform, |_| Ok(Flow::Stop));
        let echo = Echo::default();
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", echo.clone());
        let env = env_with(registry, hooks);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        assert_eq!(job.process().await.unwrap(), Processed::Skipped);
        assert!(echo.performed().is_empty());
        assert!(daemon.dispositions().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_job_is_skipped() {
        let daemon = FakeDaemon::new();
        let id = daemon.push(r#"{"class":"Echo","args":[]}"#, 10);
        let echo = Echo::default();
        let env = echo_env(&echo);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();
        daemon.vanish(id);

        assert_eq!(job.process().await.unwrap(), Processed::Skipped);
        assert!(echo.performed().is_empty());
    }

    #[tokio::test]
    async fn test_disposes_once() {
        let daemon = FakeDaemon::new();
        let id = daemon.push(r#"{"class":"Echo","args":[]}"#, 10);
        let env = echo_env(&Echo::default());

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        job.stats().await.unwrap();
        job.bury().await.unwrap();
        assert!(matches!(job.bury().await, Err(JobError::AlreadyDisposed)));
        assert!(matches!(
            job.retry(1, 5).await,
            Err(JobError::AlreadyDisposed)
        ));
        assert!(matches!(job.delete().await, Err(JobError::AlreadyDisposed)));

        assert_eq!(daemon.dispositions(), [Call::Bury { id, pri: 100 }]);
    }

    #[tokio::test]
    async fn test_retry_releases_with_delay() {
        let daemon = FakeDaemon::new();
        let id = daemon.push(r#"{"class":"Echo","args":[]}"#, 10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = recording_hooks(log.clone());
        let env = env_with(HandlerRegistry::new(), hooks);

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await.unwrap();

        job.retry(2, 13).await.unwrap();

        assert_eq!(
            daemon.dispositions(),
            // Priority falls back to the default without a stats lookup.
            [Call::Release { id, pri: 65536, delay: 13 }]
        );
        assert_eq!(*log.lock().unwrap(), ["OnRetry:Echo:2:13"]);
    }

    #[test]
    fn test_timeout_bound() {
        assert_eq!(timeout_bound(0), None);
        assert_eq!(timeout_bound(1), Some(Duration::from_secs(1)));
        assert_eq!(timeout_bound(2), Some(Duration::from_secs(1)));
        assert_eq!(timeout_bound(120), Some(Duration::from_secs(119)));
    }

    async fn run_sleepy(
        sleep: Duration,
        ttr: u32,
    ) -> Result<Processed, JobError> {
        let daemon = FakeDaemon::new();
        daemon.push(r#"{"class":"Sleepy","args":[]}"#, ttr);
        let mut registry = HandlerRegistry::new();
        registry.register("Sleepy", Sleepy(sleep));
        let env = env_with(registry, Hooks::new());

        let mut conn = daemon.connection("a");
        let message = conn.reserve(Duration::ZERO).await.unwrap().unwrap();
        let mut job = Job::new(&env, &mut conn, message).await?;
        job.process().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout() {
        match run_sleepy(Duration::from_secs(5), 3).await {
            Err(JobError::Timeout { handler, seconds, trace }) => {
                assert_eq!(handler, "Sleepy");
                assert_eq!(seconds, 2);
                assert!(!trace.is_empty());
            },
            other => panic!("expected a timeout, got {other:?}"),
        }

        // One second ttr still allows one second.
        assert!(matches!(
            run_sleepy(Duration::from_millis(500), 1).await,
            Ok(Processed::Completed)
        ));
        assert!(matches!(
            run_sleepy(Duration::from_millis(1500), 1).await,
            Err(JobError::Timeout { seconds: 1, .. })
        ));

        // No limit at all.
        assert!(matches!(
            run_sleepy(Duration::from_secs(3600), 0).await,
            Ok(Processed::Completed)
        ));
    }
}
