//! Per-connection read/dispatch/write loop.
//!
//! A session reads newline-terminated lines into its own buffer, strips the
//! trailing CR/LF, skips empty lines and hands everything else to the
//! [`CommandDispatcher`]. An idle deadline is armed before each line is read;
//! if it passes before a full line arrives the session ends.
//!
//! The session owns its stream, so returning from [`ConnectionSession::run`]
//! closes the connection.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::commands::CommandDispatcher;

/// Initial read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum wait for the next complete line.
    pub idle_timeout: Duration,
    /// Maximum length of one line, excluding its terminator.
    pub max_line_length: usize,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side of the connection.
    Disconnected,
    /// The client sent a terminating command.
    Quit,
}

/// Failure that ends a single session.
#[derive(Debug)]
pub enum SessionError {
    Read(io::Error),
    Write(io::Error),
    IdleTimeout(Duration),
    LineTooLong(usize),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Read(e) => write!(f, "read failed: {e}"),
            SessionError::Write(e) => write!(f, "write failed: {e}"),
            SessionError::IdleTimeout(after) => {
                write!(f, "idle timeout after {}s", after.as_secs_f64())
            }
            SessionError::LineTooLong(limit) => {
                write!(f, "line exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Read(e) | SessionError::Write(e) => Some(e),
            _ => None,
        }
    }
}

/// One accepted connection.
pub struct ConnectionSession<S> {
    stream: S,
    buffer: BytesMut,
    dispatcher: Arc<CommandDispatcher>,
    limits: SessionLimits,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, dispatcher: Arc<CommandDispatcher>, limits: SessionLimits) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            dispatcher,
            limits,
        }
    }

    /// Serve the connection until the client leaves, quits, idles out or an
    /// I/O error occurs. The stream is dropped (closed) on return.
    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let deadline = Instant::now() + self.limits.idle_timeout;

            let Some(line) = self.read_line(deadline).await? else {
                return Ok(SessionEnd::Disconnected);
            };

            let line = trim_line_ending(&line);
            if line.is_empty() {
                continue;
            }

            trace!(line = %String::from_utf8_lossy(line), "Processing line");
            let reply = self.dispatcher.dispatch(line);

            self.stream
                .write_all(&reply.body)
                .await
                .map_err(SessionError::Write)?;
            self.stream.flush().await.map_err(SessionError::Write)?;

            if !reply.keeps_open() {
                // Best effort: the connection is closed on drop either way.
                let _ = self.stream.shutdown().await;
                return Ok(SessionEnd::Quit);
            }
        }
    }

    /// Read the next line including its terminator.
    ///
    /// Returns `None` on end of stream. Bytes after the last newline are
    /// discarded when the peer closes.
    async fn read_line(&mut self, deadline: Instant) -> Result<Option<BytesMut>, SessionError> {
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.buffer[scanned..].iter().position(|&b| b == b'\n') {
                if scanned + pos > self.limits.max_line_length {
                    return Err(SessionError::LineTooLong(self.limits.max_line_length));
                }
                return Ok(Some(self.buffer.split_to(scanned + pos + 1)));
            }
            scanned = self.buffer.len();

            if scanned > self.limits.max_line_length {
                return Err(SessionError::LineTooLong(self.limits.max_line_length));
            }

            let read = timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await;
            let n = match read {
                Ok(result) => result.map_err(SessionError::Read)?,
                Err(_) => return Err(SessionError::IdleTimeout(self.limits.idle_timeout)),
            };

            if n == 0 {
                return Ok(None);
            }
        }
    }
}

/// Strip every trailing `\r` and `\n`.
fn trim_line_ending(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|&b| b != b'\r' && b != b'\n')
        .map_or(0, |pos| pos + 1);
    &line[..end]
}
