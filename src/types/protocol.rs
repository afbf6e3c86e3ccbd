use bytes::Bytes;
use serde::Deserialize;

use super::serialisable::BeanstalkSerialisable;
use super::states::JobState;

/// Every command the worker and producer send to a queue daemon. Each variant
/// serialises to a single line, with `put` also carrying its body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// `put <pri> <delay> <ttr> <bytes>`, then the body. Lands on the tube
    /// chosen by the last `use`.
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    },
    /// `reserve-with-timeout <seconds>`. Answered with `TIMED_OUT` when
    /// nothing is ready in time.
    ReserveWithTimeout { timeout: u32 },
    /// `release <id> <pri> <delay>`. Only valid for a job this connection
    /// holds; a non-zero delay parks it in the delayed state.
    Release { id: u64, pri: u32, delay: u32 },
    /// `delete <id>`
    Delete { id: u64 },
    /// `bury <id> <pri>`. Only valid for a job this connection holds.
    Bury { id: u64, pri: u32 },
    /// `watch <tube>`
    Watch { tube: String },
    /// `ignore <tube>`
    Ignore { tube: String },
    /// `use <tube>`, selecting where later puts go.
    Use { tube: String },
    /// `stats-job <id>`, answered with a YAML mapping.
    StatsJob { id: u64 },
    /// `list-tubes`, answered with a YAML sequence of every tube.
    ListTubes,
    /// `list-tubes-watched`, answered with a YAML sequence.
    ListTubesWatched,
}

impl BeanstalkSerialisable for BeanstalkCommand {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkCommand::*;

        match self {
            Put {
                pri,
                delay,
                ttr,
                data,
            } => [
                format!("put {pri} {delay} {ttr} {}\r\n", data.len())
                    .into_bytes(),
                data.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            ReserveWithTimeout { timeout } => {
                format!("reserve-with-timeout {timeout}\r\n").into()
            },
            Release { id, pri, delay } => {
                format!("release {id} {pri} {delay}\r\n").into()
            },
            Delete { id } => format!("delete {id}\r\n").into(),
            Bury { id, pri } => format!("bury {id} {pri}\r\n").into(),
            Watch { tube } => format!("watch {tube}\r\n").into(),
            Ignore { tube } => format!("ignore {tube}\r\n").into(),
            Use { tube } => format!("use {tube}\r\n").into(),
            StatsJob { id } => format!("stats-job {id}\r\n").into(),
            ListTubes => b"list-tubes\r\n".to_vec(),
            ListTubesWatched => b"list-tubes-watched\r\n".to_vec(),
        }
    }
}

/// The first line of a daemon reply. Replies with a body (`RESERVED`, `OK`)
/// only carry the body length here and the bytes follow on the stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    /// `OUT_OF_MEMORY`
    OutOfMemory,
    /// `INTERNAL_ERROR`, a daemon bug.
    InternalError,
    /// `BAD_FORMAT`, our command line was malformed.
    BadFormat,
    /// `UNKNOWN_COMMAND`
    UnknownCommand,
    /// `INSERTED <id>` after a successful put.
    Inserted { id: u64 },
    /// `BURIED <id>` after a put the daemon had no memory to queue.
    BuriedId { id: u64 },
    /// `EXPECTED_CRLF`, the put body was not followed by CRLF.
    ExpectedCrlf,
    /// `JOB_TOO_BIG`, the put body is over the daemon's size limit.
    JobTooBig,
    /// `DRAINING`, the daemon refuses new jobs.
    Draining,
    /// `USING <tube>` after a use.
    Using { tube: String },
    /// `DEADLINE_SOON`, a held job is close to its ttr.
    DeadlineSoon,
    /// `TIMED_OUT`, nothing was ready before the reserve timeout.
    TimedOut,
    /// `RESERVED <id> <n_bytes>`, followed by the job body.
    Reserved { id: u64, n_bytes: u32 },
    /// `NOT_FOUND`, the job is gone or not held by this connection.
    NotFound,
    /// `DELETED`
    Deleted,
    /// `RELEASED`
    Released,
    /// `BURIED` after a bury, or after a release the daemon could not queue.
    Buried,
    /// `WATCHING <count>` after a watch or ignore.
    Watching { count: u32 },
    /// `NOT_IGNORED`, ignoring would leave the watchlist empty.
    NotIgnored,
    /// `OK <n_bytes>`, followed by a YAML body.
    Ok { n_bytes: u32 },
}

/// The YAML body of a `stats-job` reply. Only the counters the worker acts
/// on matter, but every key the daemon sends is kept.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct JobStats {
    pub id: u64,
    pub tube: String,
    pub state: JobState,
    /// Priority from the most recent put, release or bury.
    pub pri: u32,
    pub age: u32,
    pub delay: u32,
    pub ttr: u32,
    /// Seconds before a reserved or delayed job goes back to ready.
    #[serde(rename = "time-left")]
    pub time_left: u32,
    #[serde(default)]
    pub file: u32,
    pub reserves: u64,
    pub timeouts: u64,
    /// Release count, used as the retry attempt number.
    pub releases: u64,
    /// Bury count, checked against the bury limit.
    pub buries: u64,
    pub kicks: u64,
}
