mod args;
mod handlers;

use std::future::{self, Future};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use enchanted_worker::config::Configuration;
use enchanted_worker::connection::TcpConnector;
use enchanted_worker::environment::{Environment, ErrorHandler};
use enchanted_worker::pool::ConnectionPool;
use enchanted_worker::producer::{enqueue, EnqueueOptions};
use enchanted_worker::worker::run_workers;
use serde_json::Value;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!("encountered runtime error: {error:#}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM. The SIGTERM handler is in
/// place once this returns, before the future is first polled.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = match signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(error) => {
            warn!(%error, "can't listen for SIGTERM");
            None
        },
    };

    async move {
        let ctrl_c = async {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
                future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                },
                None => future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("interrupted; stopping"),
            () = terminate => info!("terminated; stopping"),
        }
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Configuration::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Configuration::default(),
    };
    if !args.urls.is_empty() {
        config.beanstalk_urls = args.urls;
    }

    let connector = Arc::new(TcpConnector {
        connect_timeout: config.pool.connect_timeout(),
        io_timeout: config.pool.io_timeout(),
    });

    let env = Arc::new(
        Environment::new(config)
            .with_registry(handlers::registry())
            .with_error_handler(ErrorHandler::error_and_job(
                |error, job, args| {
                    error!(job, ?args, %error, "job failed");
                    Ok(())
                },
            )),
    );

    match args.command {
        Command::Work {
            queues,
            concurrency,
        } => {
            run_workers(env, connector, queues, concurrency, cancel).await?;
        },
        Command::Enqueue {
            class,
            arguments,
            queue,
            priority,
            delay,
            ttr,
        } => {
            let job_args: Vec<Value> = arguments
                .into_iter()
                .map(|arg| {
                    serde_json::from_str(&arg).unwrap_or(Value::String(arg))
                })
                .collect();

            let mut pool = ConnectionPool::new(
                env.config.beanstalk_urls.iter().cloned(),
                connector,
                env.config.pool.clone(),
            )?;

            let options = EnqueueOptions {
                queue,
                priority,
                delay,
                ttr,
                carrier: None,
            };

            match enqueue(&env, &mut pool, &class, &job_args, options).await? {
                Some(id) => info!(id, job = %class, "enqueued"),
                None => warn!(job = %class, "enqueue stopped by a hook"),
            }
        },
    }

    Ok(())
}
