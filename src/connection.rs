//! Client side of the beanstalk protocol.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::line_reader::LineReader;
use crate::types::message::RawMessage;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse, JobStats};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// Default port of a beanstalkd server.
pub const DEFAULT_PORT: u16 = 11300;

/// The operations a worker needs from one queue daemon connection.
#[async_trait]
pub trait Connection: Send {
    /// The address this connection was opened against.
    fn url(&self) -> &str;

    /// Reserves a message from the watched tubes, waiting up to `timeout`.
    /// Returns `None` when no message became available in time.
    async fn reserve(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, TransportError>;

    /// Puts a message on `tube`, returning its ID.
    async fn put(
        &mut self,
        tube: &str,
        body: Bytes,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<u64, TransportError>;

    async fn delete(&mut self, id: u64) -> Result<(), TransportError>;

    async fn release(
        &mut self,
        id: u64,
        pri: u32,
        delay: u32,
    ) -> Result<(), TransportError>;

    async fn bury(&mut self, id: u64, pri: u32) -> Result<(), TransportError>;

    async fn stats(&mut self, id: u64) -> Result<JobStats, TransportError>;

    /// Lists every tube known to the daemon.
    async fn list_tubes(&mut self) -> Result<Vec<String>, TransportError>;

    /// Makes `tubes` the exact watchlist of this connection.
    async fn watch(&mut self, tubes: &[String]) -> Result<(), TransportError>;
}

/// Opens connections to daemon addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// A beanstalk protocol client over any bidirectional byte stream.
pub struct BeanstalkConnection<S: AsyncRead + Unpin> {
    url: String,
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// Upper bound on a single command/response exchange.
    io_timeout: Duration,
    /// Tube most recently selected with `use`.
    using: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> BeanstalkConnection<S> {
    pub fn new(
        url: impl Into<String>,
        stream: S,
        io_timeout: Duration,
    ) -> Self {
        let (r, w) = tokio::io::split(stream);

        Self {
            url: url.into(),
            reader: r.into(),
            writer: w,
            io_timeout,
            using: None,
        }
    }

    async fn send(
        &mut self,
        cmd: &BeanstalkCommand,
    ) -> Result<(), TransportError> {
        let bytes = cmd.serialise_beanstalk();
        trace!(command = bytes_to_human_str(&bytes), "sending");

        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn recv(&mut self) -> Result<BeanstalkResponse, TransportError> {
        let line = self
            .reader
            .read_line()
            .await?
            .ok_or(TransportError::NotConnected)?;
        trace!(line = bytes_to_human_str(&line), "received");

        Ok((&line as &[u8]).try_into()?)
    }

    /// Sends a command and reads the response line, giving up after `wait`.
    async fn round_trip(
        &mut self,
        cmd: BeanstalkCommand,
        wait: Duration,
    ) -> Result<BeanstalkResponse, TransportError> {
        timeout(wait, async {
            self.send(&cmd).await?;
            self.recv().await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn command(
        &mut self,
        cmd: BeanstalkCommand,
    ) -> Result<BeanstalkResponse, TransportError> {
        self.round_trip(cmd, self.io_timeout).await
    }

    async fn read_data(
        &mut self,
        n_bytes: u32,
    ) -> Result<Bytes, TransportError> {
        timeout(self.io_timeout, self.reader.read_data(n_bytes as usize))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    /// Runs a command answered by `OK <n_bytes>` and a YAML document.
    async fn yaml<T: DeserializeOwned>(
        &mut self,
        cmd: BeanstalkCommand,
    ) -> Result<T, TransportError> {
        match self.command(cmd).await? {
            BeanstalkResponse::Ok { n_bytes } => {
                let data = self.read_data(n_bytes).await?;
                Ok(serde_yaml::from_slice(&data)?)
            },
            other => Err(unexpected(other)),
        }
    }

    async fn use_tube(&mut self, tube: &str) -> Result<(), TransportError> {
        if self.using.as_deref() == Some(tube) {
            return Ok(());
        }

        match self
            .command(BeanstalkCommand::Use {
                tube: tube.to_owned(),
            })
            .await?
        {
            BeanstalkResponse::Using { tube } => {
                self.using = Some(tube);
                Ok(())
            },
            other => Err(unexpected(other)),
        }
    }
}

/// Maps a response that doesn't answer the command sent to an error.
fn unexpected(resp: BeanstalkResponse) -> TransportError {
    use BeanstalkResponse::*;

    match resp {
        NotFound => TransportError::NotFound,
        OutOfMemory | InternalError | BadFormat | UnknownCommand
        | ExpectedCrlf | JobTooBig | Draining => {
            TransportError::Server(format!("{resp:?}"))
        },
        other => TransportError::Unexpected(format!("{other:?}")),
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> Connection
    for BeanstalkConnection<S>
{
    fn url(&self) -> &str {
        &self.url
    }

    async fn reserve(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, TransportError> {
        let secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        let cmd = BeanstalkCommand::ReserveWithTimeout { timeout: secs };

        // The server holds the response for up to `timeout` itself.
        match self.round_trip(cmd, timeout + self.io_timeout).await? {
            BeanstalkResponse::Reserved { id, n_bytes } => {
                let body = self.read_data(n_bytes).await?;
                Ok(Some(RawMessage { id, body }))
            },
            BeanstalkResponse::TimedOut | BeanstalkResponse::DeadlineSoon => {
                Ok(None)
            },
            other => Err(unexpected(other)),
        }
    }

    async fn put(
        &mut self,
        tube: &str,
        body: Bytes,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<u64, TransportError> {
        self.use_tube(tube).await?;

        let cmd = BeanstalkCommand::Put {
            pri,
            delay,
            ttr,
            data: body,
        };

        match self.command(cmd).await? {
            BeanstalkResponse::Inserted { id } => Ok(id),
            BeanstalkResponse::BuriedId { id } => {
                warn!(id, tube, "server buried job on insert");
                Ok(id)
            },
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&mut self, id: u64) -> Result<(), TransportError> {
        match self.command(BeanstalkCommand::Delete { id }).await? {
            BeanstalkResponse::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn release(
        &mut self,
        id: u64,
        pri: u32,
        delay: u32,
    ) -> Result<(), TransportError> {
        let cmd = BeanstalkCommand::Release { id, pri, delay };

        match self.command(cmd).await? {
            BeanstalkResponse::Released => Ok(()),
            BeanstalkResponse::Buried => {
                warn!(id, "server buried job on release");
                Ok(())
            },
            other => Err(unexpected(other)),
        }
    }

    async fn bury(&mut self, id: u64, pri: u32) -> Result<(), TransportError> {
        match self.command(BeanstalkCommand::Bury { id, pri }).await? {
            BeanstalkResponse::Buried => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn stats(&mut self, id: u64) -> Result<JobStats, TransportError> {
        self.yaml(BeanstalkCommand::StatsJob { id }).await
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, TransportError> {
        self.yaml(BeanstalkCommand::ListTubes).await
    }

    async fn watch(&mut self, tubes: &[String]) -> Result<(), TransportError> {
        if tubes.is_empty() {
            return Ok(());
        }

        // Watch first: ignoring the last watched tube is refused.
        for tube in tubes {
            let cmd = BeanstalkCommand::Watch { tube: tube.clone() };
            match self.command(cmd).await? {
                BeanstalkResponse::Watching { .. } => {},
                other => return Err(unexpected(other)),
            }
        }

        let watched: Vec<String> =
            self.yaml(BeanstalkCommand::ListTubesWatched).await?;

        for tube in watched.into_iter().filter(|t| !tubes.contains(t)) {
            match self.command(BeanstalkCommand::Ignore { tube }).await? {
                BeanstalkResponse::Watching { .. }
                | BeanstalkResponse::NotIgnored => {},
                other => return Err(unexpected(other)),
            }
        }

        debug!(url = %self.url, ?tubes, "watching");

        Ok(())
    }
}

/// Opens plain TCP connections.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let addr = socket_address(address);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!(%addr, "connected");

        Ok(Box::new(BeanstalkConnection::new(
            address,
            stream,
            self.io_timeout,
        )))
    }
}

/// Turns `beanstalk://host:port/` or `host` into `host:port`.
pub fn socket_address(url: &str) -> String {
    let addr = url.strip_prefix("beanstalk://").unwrap_or(url);
    let addr = addr.trim_end_matches('/');

    // A bracketed IPv6 literal carries its own colons.
    let has_port = match addr.rfind(']') {
        Some(end) => addr[end..].contains(':'),
        None => addr.contains(':'),
    };

    if has_port {
        addr.to_owned()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::types::states::JobState;

    /// Plays the server side of a conversation: for each pair, expects the
    /// exact request bytes then writes the reply.
    fn script(
        exchanges: &'static [(&'static [u8], &'static [u8])],
    ) -> (BeanstalkConnection<DuplexStream>, JoinHandle<()>) {
        let (client, mut server) = duplex(4096);

        let handle = tokio::spawn(async move {
            for (request, reply) in exchanges {
                let mut buf = vec![0; request.len()];
                server.read_exact(&mut buf).await.unwrap();
                assert_eq!(
                    bytes_to_human_str(&buf),
                    bytes_to_human_str(request)
                );
                server.write_all(reply).await.unwrap();
            }
        });

        let conn = BeanstalkConnection::new(
            "beanstalk://test",
            client,
            Duration::from_secs(1),
        );

        (conn, handle)
    }

    #[tokio::test]
    async fn test_reserve_and_dispose() {
        let (mut conn, server) = script(&[
            (
                b"reserve-with-timeout 2\r\n",
                b"RESERVED 7 5\r\nhello\r\n",
            ),
            (b"delete 7\r\n", b"DELETED\r\n"),
            (b"release 7 10 30\r\n", b"RELEASED\r\n"),
            (b"bury 7 10\r\n", b"NOT_FOUND\r\n"),
            (b"reserve-with-timeout 2\r\n", b"TIMED_OUT\r\n"),
        ]);

        let msg = conn.reserve(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg, Some(RawMessage::new(7, "hello")));

        conn.delete(7).await.unwrap();
        conn.release(7, 10, 30).await.unwrap();
        assert!(matches!(
            conn.bury(7, 10).await,
            Err(TransportError::NotFound)
        ));
        assert_eq!(conn.reserve(Duration::from_secs(2)).await.unwrap(), None);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_and_put() {
        let (mut conn, server) = script(&[
            (
                b"stats-job 7\r\n",
                b"OK 152\r\n---\nid: 7\ntube: jobs.mailer\nstate: reserved\n\
                  pri: 5\nage: 1\ndelay: 0\nttr: 60\ntime-left: 59\nfile: \
                  0\nreserves: 1\ntimeouts: 0\nreleases: 2\nburies: 1\n\
                  kicks: 0\n\r\n",
            ),
            (b"use jobs.mailer\r\n", b"USING jobs.mailer\r\n"),
            (b"put 5 0 60 2\r\n{}\r\n", b"INSERTED 8\r\n"),
            // The tube is remembered between puts.
            (b"put 5 0 60 2\r\n[]\r\n", b"JOB_TOO_BIG\r\n"),
        ]);

        let stats = conn.stats(7).await.unwrap();
        assert_eq!(stats.state, JobState::Reserved);
        assert_eq!(stats.pri, 5);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.buries, 1);

        let id = conn
            .put("jobs.mailer", Bytes::from_static(b"{}"), 5, 0, 60)
            .await
            .unwrap();
        assert_eq!(id, 8);

        let err = conn
            .put("jobs.mailer", Bytes::from_static(b"[]"), 5, 0, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Server(_)));
        assert!(!err.is_transient());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_ignores_other_tubes() {
        let (mut conn, server) = script(&[
            (b"watch jobs.a\r\n", b"WATCHING 2\r\n"),
            (
                b"list-tubes-watched\r\n",
                b"OK 23\r\n---\n- default\n- jobs.a\n\r\n",
            ),
            (b"ignore default\r\n", b"WATCHING 1\r\n"),
        ]);

        conn.watch(&["jobs.a".to_owned()]).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_is_not_connected() {
        let (client, server) = duplex(64);
        drop(server);

        let mut conn =
            BeanstalkConnection::new("test", client, Duration::from_secs(1));

        let err = conn.delete(1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (client, _server) = duplex(64);

        let mut conn =
            BeanstalkConnection::new("test", client, Duration::from_secs(1));

        assert!(matches!(
            conn.reserve(Duration::from_secs(5)).await,
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_socket_address() {
        assert_eq!(
            socket_address("beanstalk://localhost:11301/"),
            "localhost:11301"
        );
        assert_eq!(socket_address("beanstalk://10.0.0.1"), "10.0.0.1:11300");
        assert_eq!(socket_address("queue.internal"), "queue.internal:11300");
        assert_eq!(socket_address("[::1]"), "[::1]:11300");
        assert_eq!(socket_address("[::1]:9000"), "[::1]:9000");
    }
}
