//! # evsock
//!
//! Callback-driven TCP and UDP sockets on a single-threaded readiness loop
//! (`epoll` on Linux, `kqueue` on BSD and Apple platforms).
//!
//! A [`Reactor`] owns every socket. Applications register [`Callbacks`] for
//! the three stream events (open, read, close), then drive the loop with
//! [`Reactor::run`] or [`Reactor::run_once`]. Inside a callback the stream is
//! available as `&mut Stream`; elsewhere, [`Handle::with_stream`] gives the
//! same access by id.
//!
//! ```rust,no_run
//! use evsock::{Callbacks, CloseReason, Reactor};
//!
//! fn main() -> evsock::Result<()> {
//!   let mut reactor = Reactor::new()?;
//!
//!   let callbacks = Callbacks::new()
//!     .on_open(|stream| {
//!       let _ = stream.send(b"hello\n");
//!     })
//!     .on_read(|stream, data| {
//!       if data.starts_with(b"quit") {
//!         stream.close();
//!       } else {
//!         let _ = stream.send(data);
//!       }
//!     })
//!     .on_close(|stream, reason: &CloseReason| {
//!       println!("{} left: {reason}", stream.remote_address());
//!     });
//!
//!   reactor.listen("0.0.0.0", 5555, callbacks)?;
//!   reactor.run()?;
//!   Ok(())
//! }
//! ```
//!
//! ## Semantics worth knowing
//!
//! - Sends never block. Bytes the kernel does not take are queued in a
//!   bounded per-stream buffer; overflowing it closes the stream with
//!   [`CloseReason::SendBufferFull`].
//! - `on_close` runs exactly once per stream, synchronously, from whatever
//!   closed it. The stream stays valid until the callback that closed it
//!   returns.
//! - Everything is `!Send`. One reactor, one thread.

#[macro_use]
mod macros;

pub mod config;
mod error;
mod net;
mod reactor;
pub mod ring;

pub use config::Config;
pub use error::{CloseReason, Error, Result, SendError};
pub use net::{
  Callbacks, CloseFn, Datagram, Listener, OpenFn, ReadFn, RecvFn, Stream,
};
pub use reactor::{
  DatagramId, Event, Handle, Interest, ListenerId, ReadinessPoll, Reactor,
  StreamId,
};
pub use ring::RingBuffer;
