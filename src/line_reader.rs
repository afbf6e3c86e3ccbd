use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads CRLF-terminated response lines, and the length-prefixed data blocks
/// that follow `RESERVED` and `OK` lines, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Bytes read but not yet handed out.
    buf: BytesMut,
    /// No CRLF starts before this index of `buf`.
    maybe_crlf_from: usize,
    reader: T,
    /// A read error, reported once buffered lines are exhausted.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Returns the next line without its CRLF, or `None` once the stream
    /// ends. A partial line left at end of stream is discarded.
    ///
    /// Cancel-safe: the only await is the `read_buf` inside `fill`, and bytes
    /// it reads stay buffered for the next call.
    ///
    /// A read error is held back until every complete line already buffered
    /// has been handed out.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Only the unscanned tail is searched, starting one byte early so
            // a CR and LF split across reads are still paired.
            if let Some(eol) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|pair| pair == (&b'\r', &b'\n'))
            {
                let end = self.maybe_crlf_from + eol;
                let mut line = self.buf.split_to(end + 2);
                line.truncate(end);

                self.maybe_crlf_from = 0;

                return Ok(Some(line.freeze()));
            }

            let n_bytes_read = self.fill().await;
            if n_bytes_read == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }

            // Everything before the new bytes, bar the last old byte, is
            // known to hold no CRLF.
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);
        }
    }

    /// Reads a data block of exactly `n_bytes` followed by a CRLF, returning
    /// the block without its terminator. Ends of stream before the block is
    /// complete are reported as `UnexpectedEof`.
    pub async fn read_data(&mut self, n_bytes: usize) -> io::Result<Bytes> {
        let want = n_bytes + 2;

        while self.buf.len() < want {
            if self.fill().await == 0 {
                return Err(self
                    .pending_error
                    .take()
                    .unwrap_or_else(|| io::ErrorKind::UnexpectedEof.into()));
            }
        }

        let data = self.buf.split_to(want).freeze();
        self.maybe_crlf_from = 0;

        if &data[n_bytes..] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "data block not terminated by CRLF",
            ));
        }

        Ok(data.slice(0..n_bytes))
    }

    /// Tries reading from the reader into the buffer, returning the number of
    /// bytes read. Errors are parked in `pending_error` and reported as a zero
    /// length read.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}
