//! The reserve, process and dispose loop.
use std::sync::Arc;

use itertools::Itertools;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, Connector};
use crate::environment::Environment;
use crate::error::{JobError, PoolError, TransportError, WorkerError};
use crate::hooks::{HookContext, HookDetail, HookEvent};
use crate::job::{Job, Processed};
use crate::pool::ConnectionPool;
use crate::types::message::RawMessage;

/// What one pass of [`Worker::work_one_job`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Nothing was ready before the reserve timed out.
    Idle,
    Completed,
    /// A hook stopped the job, or it vanished before running.
    Skipped,
    Retried { attempt: u64, delay: u64 },
    Buried,
    Dropped,
    /// The job failed and was left undisposed, either because its message
    /// was already deleted or because its counters couldn't be read.
    Failed,
    /// The message body couldn't be decoded and was buried.
    Invalid,
    /// The message was gone when it came to disposing of it.
    Vanished,
    /// A daemon request failed; the endpoint has been taken out of rotation.
    TransportFailure,
    /// Every endpoint had gone away and a connection was reopened.
    Reconnected,
    /// Every endpoint had gone away and none could be reopened.
    Unavailable,
}

/// Splits comma-separated names, trims them and removes blanks and
/// duplicates, keeping the first occurrence of each.
pub fn normalize_tube_names<I, S>(requested: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    requested
        .into_iter()
        .flat_map(|names| {
            names
                .as_ref()
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .unique()
        .collect()
}

pub struct Worker {
    env: Arc<Environment>,
    name: String,
    tubes: Vec<String>,
}

impl Worker {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            name: "worker".to_owned(),
            tubes: Vec::new(),
        }
    }

    /// Names the worker in its log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The fully qualified tubes this worker watches.
    pub fn tubes(&self) -> &[String] {
        &self.tubes
    }

    /// Builds a pool over the configured daemons whose reconnects run the
    /// `on_reconnect` hooks.
    pub fn connect_pool(
        &self,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectionPool, PoolError> {
        let config = &self.env.config;
        let mut pool = ConnectionPool::new(
            config.beanstalk_urls.iter().cloned(),
            connector,
            config.pool.clone(),
        )?;

        let env = self.env.clone();
        pool.set_on_reconnect(move |address| {
            let ctx = HookContext::new(HookEvent::OnReconnect, "", &[])
                .with_detail(HookDetail::Endpoint(address));
            env.hooks.notify(&ctx);
        });

        Ok(pool)
    }

    /// Resolves the tubes to work. Explicit names win, then the configured
    /// default queues; with neither, every namespaced tube the daemon knows,
    /// every handler's queue and the primary queue. All names come back
    /// expanded into the namespace.
    pub async fn process_tube_names<I, S>(
        &self,
        pool: &mut ConnectionPool,
        requested: I,
    ) -> Result<Vec<String>, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = &self.env.config;
        let mut names = normalize_tube_names(requested);

        if names.is_empty() {
            names = normalize_tube_names(&config.default_queues);
        }

        if names.is_empty() {
            let existing = pool.retryable(|conn| conn.list_tubes()).await?;

            names = existing
                .into_iter()
                .filter(|tube| tube.starts_with(&config.tube_namespace))
                .chain(self.env.registry.queue_names())
                .chain([config.primary_queue.clone()])
                .collect();
        }

        Ok(names
            .iter()
            .map(|name| config.expand_tube_name(name))
            .unique()
            .collect())
    }

    /// Resolves the worker's tubes and has the pool watch them.
    pub async fn prepare<I, S>(
        &mut self,
        pool: &mut ConnectionPool,
        requested: I,
    ) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tubes = self.process_tube_names(pool, requested).await?;
        pool.watch(self.tubes.clone()).await;

        info!(worker = %self.name, tubes = ?self.tubes, "watching tubes");

        Ok(())
    }

    /// Works jobs until `cancel` fires. Cancellation stops at once, dropping
    /// any job in flight; the daemon releases its message when the ttr
    /// expires.
    pub async fn start(
        &self,
        pool: &mut ConnectionPool,
        cancel: CancellationToken,
    ) {
        info!(worker = %self.name, "worker started");

        loop {
            select! {
                outcome = self.work_one_job(pool) => {
                    debug!(worker = %self.name, ?outcome, "pass finished");
                },
                _ = cancel.cancelled() => break,
            }
        }

        info!(worker = %self.name, "worker stopped");
    }

    /// Reserves one message, processes it, and disposes of it according to
    /// the outcome. Transport failures take the endpoint out of rotation and
    /// are never passed to the error handler.
    #[instrument(skip_all, fields(worker = %self.name))]
    pub async fn work_one_job(&self, pool: &mut ConnectionPool) -> Outcome {
        let id = pool.pick();

        let conn = match pool.connection(id).await {
            Ok(conn) => conn,
            Err(PoolError::NoActiveConnection) => {
                warn!("no active connection; reconnecting");
                return match pool.reconnect_with_backoff().await {
                    Ok(_) => Outcome::Reconnected,
                    Err(error) => {
                        error!(%error, "reconnect failed");
                        Outcome::Unavailable
                    },
                };
            },
            Err(error) => {
                debug!(%error, "endpoint unavailable");
                return Outcome::TransportFailure;
            },
        };

        let url = conn.url().to_owned();

        let wait = self.env.config.reserve_timeout();

        let message = match conn.reserve(wait).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                pool.success(id);
                return Outcome::Idle;
            },
            Err(error) => {
                warn!(%url, %error, "reserve failed");
                pool.deactivate(id);
                return Outcome::TransportFailure;
            },
        };

        let outcome = self.run_job(conn, message).await;

        match outcome {
            Outcome::TransportFailure | Outcome::Vanished => {
                pool.deactivate(id);
            },
            _ => pool.success(id),
        }

        outcome
    }

    async fn run_job(
        &self,
        conn: &mut dyn Connection,
        message: RawMessage,
    ) -> Outcome {
        let id = message.id;

        let mut job = match Job::new(&self.env, conn, message).await {
            Ok(job) => job,
            Err(error) => {
                error!(id, %error, "buried undecodable job");
                return Outcome::Invalid;
            },
        };

        info!(id, job = job.name(), args = ?job.args(), "working job");
        let started = Instant::now();

        match job.process().await {
            Ok(Processed::Completed) => {
                info!(
                    id,
                    job = job.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                Outcome::Completed
            },
            Ok(Processed::Skipped) => {
                info!(id, job = job.name(), "job skipped");
                Outcome::Skipped
            },
            Err(JobError::Transport(error)) => transport_outcome(error),
            Err(error) => self.handle_failure(&mut job, error, started).await,
        }
    }

    /// Retries, buries or drops a failed job, then reports the failure.
    async fn handle_failure(
        &self,
        job: &mut Job<'_>,
        error: JobError,
        started: Instant,
    ) -> Outcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let id = job.message().id;
        let name = job.name().to_owned();

        if job.is_disposed() {
            error!(id, job = %name, %error, elapsed_ms, "job failed");
            self.env.report_error(&error, &name, job.args(), job.message());
            return Outcome::Failed;
        }

        // Counters are read fresh: other workers may have handled the same
        // message before.
        let stats = match job.stats().await {
            Ok(stats) => stats,
            Err(JobError::Transport(stats_error)) => {
                error!(id, job = %name, %error, elapsed_ms, "job failed");
                self.env.report_error(&error, &name, job.args(), job.message());
                return transport_outcome(stats_error);
            },
            Err(stats_error) => {
                error!(id, job = %name, %error, %stats_error, "job failed");
                self.env.report_error(&error, &name, job.args(), job.message());
                return Outcome::Failed;
            },
        };

        let config = &self.env.config;
        let max_retries = u64::from(config.max_job_retries);
        let attempt = stats.releases + 1;
        let total = max_retries + 1;

        let out_of_buries =
            config.bury_limit().is_some_and(|limit| stats.buries >= limit);
        let error = if out_of_buries {
            JobError::Dropped(Box::new(error))
        } else {
            error
        };

        let disposal = if stats.releases < max_retries {
            let delay = self.env.retry_delay_for(attempt);
            error!(
                id,
                job = %name,
                %error,
                elapsed_ms,
                "job failed, retrying in {delay}s (attempt {attempt} of \
                 {total})"
            );
            job.retry(attempt, delay)
                .await
                .map(|()| Outcome::Retried { attempt, delay })
        } else if out_of_buries {
            error!(
                id,
                job = %name,
                %error,
                elapsed_ms,
                buries = stats.buries,
                "bury limit exceeded, dropping (attempt {attempt} of \
                 {total})"
            );
            job.drop_job(&error).await.map(|()| Outcome::Dropped)
        } else {
            error!(
                id,
                job = %name,
                %error,
                elapsed_ms,
                "job failed, burying (attempt {attempt} of {total})"
            );
            job.bury().await.map(|()| Outcome::Buried)
        };

        self.env.report_error(&error, &name, job.args(), job.message());

        match disposal {
            Ok(outcome) => outcome,
            Err(JobError::Transport(error)) => transport_outcome(error),
            Err(error) => {
                error!(id, job = %name, %error, "disposing of failed job");
                Outcome::Failed
            },
        }
    }
}

fn transport_outcome(error: TransportError) -> Outcome {
    match error {
        TransportError::NotFound => {
            warn!("job vanished while processing");
            Outcome::Vanished
        },
        error => {
            warn!(%error, "transport failure while processing job");
            Outcome::TransportFailure
        },
    }
}

/// Runs `concurrency` workers, each with its own pool, until `cancel` fires.
/// A worker that fails to start or crashes cancels the rest, and the first
/// such failure is returned.
pub async fn run_workers(
    env: Arc<Environment>,
    connector: Arc<dyn Connector>,
    requested: Vec<String>,
    concurrency: usize,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let mut workers = JoinSet::new();

    for n in 0..concurrency.max(1) {
        let env = env.clone();
        let connector = connector.clone();
        let requested = requested.clone();
        let cancel = cancel.clone();

        workers.spawn(async move {
            let mut worker = Worker::new(env).with_name(format!("worker-{n}"));
            let mut pool = worker.connect_pool(connector)?;

            worker.prepare(&mut pool, &requested).await?;
            worker.start(&mut pool, cancel).await;

            Ok::<(), PoolError>(())
        });
    }

    let mut result = Ok(());

    while let Some(joined) = workers.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => {
                error!(%error, "worker failed to start");
                WorkerError::from(error)
            },
            Err(error) => {
                error!(%error, "worker task crashed");
                WorkerError::from(error)
            },
        };

        cancel.cancel();
        if result.is_ok() {
            result = Err(failure);
        }
    }

    result
}
