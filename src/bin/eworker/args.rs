use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Queue daemon to use, replacing the configured ones. May be repeated.
    #[arg(short, long = "url")]
    pub(crate) urls: Vec<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Works jobs until interrupted.
    Work {
        /// Queues to work, comma separated or repeated. Defaults to the
        /// configured queues, or every known queue.
        queues: Vec<String>,
        /// Number of concurrent workers.
        #[arg(short = 'n', long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Puts a job on its queue.
    Enqueue {
        /// Handler to run the job.
        class: String,
        /// Job arguments. Each is parsed as JSON, falling back to a string.
        arguments: Vec<String>,
        #[arg(short, long)]
        queue: Option<String>,
        #[arg(short, long)]
        priority: Option<u32>,
        /// Seconds before the job becomes ready.
        #[arg(long, default_value_t = 0)]
        delay: u32,
        /// Seconds the worker gets to finish the job.
        #[arg(long)]
        ttr: Option<u32>,
    },
}
