//! Error types.
//!
//! Failures come in two tiers:
//!
//! - **Setup failures** (`listen`, `connect`, `bind_datagram`, address
//!   resolution) are returned synchronously as [`Error`]. Nothing is retained
//!   when one of these is returned.
//! - **Connection-fatal failures** (receive/send errors, end-of-stream,
//!   send-buffer overflow, connect failure or timeout) are never returned from
//!   the reactor. They close the affected [`Stream`](crate::Stream) and the
//!   [`CloseReason`] is handed to its `on_close` callback.

use std::{fmt, io};

use thiserror::Error;

/// Result alias for setup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Setup-tier error.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Io(#[from] io::Error),

  #[error("failed to resolve {host}: {source}")]
  Resolve {
    host: String,
    #[source]
    source: io::Error,
  },

  #[error("{0} did not resolve to any address")]
  NoAddress(String),

  #[error("invalid address: {0:?}")]
  InvalidAddress(String),

  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),

  /// The id does not name a live source on this reactor.
  #[error("no such socket")]
  UnknownId,

  /// The source is currently inside one of its own callbacks. Use the
  /// `&mut` reference the callback received instead.
  #[error("socket is busy in a callback")]
  Busy,
}

/// Error returned by [`Stream::send`](crate::Stream::send).
#[derive(Debug, Error)]
pub enum SendError {
  /// The stream is closing or already closed.
  #[error("stream is closed")]
  Closed,

  /// Queuing the unsent bytes would exceed the send buffer. The stream has
  /// been closed with [`CloseReason::SendBufferFull`].
  #[error(
    "send buffer full ({queued} queued + {requested} requested > {capacity})"
  )]
  BufferFull { queued: usize, requested: usize, capacity: usize },

  /// The socket reported a non-transient error. The stream has been closed
  /// with [`CloseReason::Io`].
  #[error(transparent)]
  Io(io::Error),
}

/// Why a stream was closed. `Display` renders the human readable reason.
#[derive(Debug)]
pub enum CloseReason {
  /// The peer performed an orderly shutdown.
  EndOfStream,
  /// The application called [`Stream::close`](crate::Stream::close).
  Local,
  /// A send would have grown the queue past its capacity.
  SendBufferFull,
  /// A non-blocking connect did not complete before its deadline.
  ConnectTimedOut,
  /// The socket reported an error.
  Io(io::Error),
}

impl CloseReason {
  /// The underlying OS error, if the close was caused by one.
  pub fn io_error(&self) -> Option<&io::Error> {
    match self {
      Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl fmt::Display for CloseReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::EndOfStream => f.write_str("end of stream"),
      Self::Local => f.write_str("closed locally"),
      Self::SendBufferFull => f.write_str("send buffer full"),
      Self::ConnectTimedOut => f.write_str("connect timed out"),
      Self::Io(err) => err.fmt(f),
    }
  }
}

/// `io::Error` is not `Clone`; rebuild an equivalent one so the same failure
/// can be both returned to the caller and handed to `on_close`.
pub(crate) fn duplicate(err: &io::Error) -> io::Error {
  match err.raw_os_error() {
    Some(code) => io::Error::from_raw_os_error(code),
    None => io::Error::new(err.kind(), err.to_string()),
  }
}

/// Errors that mean "try again on the next readiness event".
pub(crate) fn is_transient(err: &io::Error) -> bool {
  matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
