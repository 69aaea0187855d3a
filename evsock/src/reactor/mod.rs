//! The reactor: one poller, a table of live sources, and the run loop.
//!
//! Every listener, stream and datagram endpoint is owned by the reactor's
//! source table. Applications hold copyable ids ([`ListenerId`],
//! [`StreamId`], [`DatagramId`]) and get `&mut` access either inside a
//! callback or through the `with_*` methods on [`Handle`].
//!
//! Dispatch is strictly sequential: one readiness event runs one source's
//! handling (and therefore its callbacks) to completion before the next event
//! is looked at. A source closed during a callback is removed from the table
//! only after that callback has returned, so the `&mut` reference the callback
//! holds stays valid until then.
//!
//! Tokens are never reused. An event that was already fetched for a source
//! that has since closed finds no entry and is dropped, it can never reach a
//! newer source.

mod interest;
mod os;
pub(crate) mod poll;

pub use interest::Interest;
pub use poll::{Event, ReadinessPoll};

use std::{
  cell::{Cell, RefCell},
  collections::HashMap,
  fmt, io,
  os::fd::RawFd,
  rc::Rc,
  time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
  config::Config,
  error::{Error, Result},
  net::{
    Callbacks, Datagram, Listener, RecvFn, Stream, addr, connector,
  },
};
use poll::{Events, OsPoller};

macro_rules! source_id {
  ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
    $(#[$doc])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct $name(pub(crate) u64);

    impl $name {
      /// Raw registration token.
      pub fn as_u64(self) -> u64 {
        self.0
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, concat!($prefix, "#{}"), self.0)
      }
    }
  };
}

source_id!(
  /// Identifies a [`Listener`] on its reactor.
  ListenerId,
  "listener"
);
source_id!(
  /// Identifies a [`Stream`] on its reactor.
  StreamId,
  "stream"
);
source_id!(
  /// Identifies a [`Datagram`] endpoint on its reactor.
  DatagramId,
  "datagram"
);

#[derive(Clone)]
enum Source {
  Listener(Rc<RefCell<Listener>>),
  Stream(Rc<RefCell<Stream>>),
  Datagram(Rc<RefCell<Datagram>>),
}

struct Shared {
  poller: OsPoller,
  config: Config,
  sources: RefCell<HashMap<u64, Source>>,
  /// Connect deadlines of streams started with `start_connect`.
  deadlines: RefCell<HashMap<u64, Instant>>,
  next_token: Cell<u64>,
  stopped: Cell<bool>,
}

/// Cheap, clonable access to a reactor from anywhere on its thread,
/// including from inside callbacks.
///
/// A `Handle` is `!Send`: all sources and their callbacks live on the thread
/// that created the reactor.
#[derive(Clone)]
pub struct Handle {
  shared: Rc<Shared>,
}

impl Handle {
  pub(crate) fn config(&self) -> &Config {
    &self.shared.config
  }

  pub(crate) fn poller(&self) -> &OsPoller {
    &self.shared.poller
  }

  pub(crate) fn next_token(&self) -> u64 {
    let token = self.shared.next_token.get();
    self.shared.next_token.set(token + 1);
    token
  }

  /// Move a descriptor's registration from `from` to `to`. An empty set
  /// removes the descriptor from the poller entirely, so a hung-up socket
  /// nobody listens to cannot keep a level-triggered poller spinning.
  pub(crate) fn reregister(
    &self,
    fd: RawFd,
    key: u64,
    from: Interest,
    to: Interest,
  ) -> io::Result<()> {
    if from == to {
      return Ok(());
    }
    trace!(key, ?from, ?to, "interest change");

    if to.is_none() {
      self.poller().delete(fd)
    } else if from.is_none() {
      self.poller().add(fd, key, to)
    } else {
      self.poller().modify(fd, key, to)
    }
  }

  pub(crate) fn disarm_deadline(&self, key: u64) {
    self.shared.deadlines.borrow_mut().remove(&key);
  }

  /// Open a TCP listener on `address:port` and start accepting.
  ///
  /// `address` is an IP literal, or `""`/`"*"` for the IPv4 wildcard. Port
  /// `0` asks the OS for a free port; see [`Listener::local_addr`].
  /// Every accepted [`Stream`] starts with a copy of `callbacks`.
  pub fn listen(
    &self,
    address: &str,
    port: u16,
    callbacks: Callbacks,
  ) -> Result<ListenerId> {
    let addr = addr::literal_addr(address, port)?;
    let listener = Listener::open(self, addr, callbacks)?;
    let id = listener.id();
    self.insert(id.0, Source::Listener(Rc::new(RefCell::new(listener))));
    Ok(id)
  }

  /// Connect to `host:port` with a **blocking** handshake.
  ///
  /// Every resolved address is tried in order until one accepts; the whole
  /// loop stalls for the duration of each attempt. Prefer
  /// [`start_connect`](Self::start_connect) inside a running loop.
  ///
  /// `on_open` runs before this returns.
  pub fn connect(
    &self,
    host: &str,
    port: u16,
    callbacks: Callbacks,
  ) -> Result<StreamId> {
    let stream = connector::connect(self, host, port, callbacks)?;
    Ok(self.adopt(stream))
  }

  /// Begin a non-blocking connect to `host:port`.
  ///
  /// Returns as soon as the kernel has accepted the attempt. `on_open` fires
  /// from the loop once the handshake completes; a refusal closes the stream
  /// with the OS error and a handshake that has not completed within
  /// `timeout` closes it with [`CloseReason::ConnectTimedOut`]. Bytes sent
  /// in the meantime are queued.
  ///
  /// [`CloseReason::ConnectTimedOut`]: crate::CloseReason::ConnectTimedOut
  pub fn start_connect(
    &self,
    host: &str,
    port: u16,
    callbacks: Callbacks,
    timeout: Duration,
  ) -> Result<StreamId> {
    let stream = connector::start_connect(self, host, port, callbacks)?;
    let connecting = stream.is_connecting();
    let id = self.adopt(stream);

    if connecting {
      match Instant::now().checked_add(timeout) {
        Some(deadline) => {
          self.shared.deadlines.borrow_mut().insert(id.0, deadline);
        }
        // too far out to represent: never expires
        None => debug!(stream = %id, "connect timeout unbounded"),
      }
    }
    Ok(id)
  }

  /// Bind a UDP endpoint on `address:port`. `on_recv` receives one datagram
  /// (or one receive error) per readiness event.
  pub fn bind_datagram(
    &self,
    address: &str,
    port: u16,
    on_recv: impl Fn(&mut Datagram, io::Result<(&[u8], std::net::SocketAddr)>)
    + 'static,
  ) -> Result<DatagramId> {
    let addr = addr::literal_addr(address, port)?;
    let on_recv: Rc<RecvFn> = Rc::new(on_recv);
    let datagram = Datagram::bind(self, addr, Some(on_recv))?;
    let id = datagram.id();
    self.insert(id.0, Source::Datagram(Rc::new(RefCell::new(datagram))));
    Ok(id)
  }

  /// Run `f` against a live stream.
  ///
  /// Fails with [`Error::Busy`] when called for the stream whose callback is
  /// currently running; use the `&mut Stream` that callback received.
  pub fn with_stream<R>(
    &self,
    id: StreamId,
    f: impl FnOnce(&mut Stream) -> R,
  ) -> Result<R> {
    let Some(Source::Stream(stream)) = self.source(id.0) else {
      return Err(Error::UnknownId);
    };

    let out = {
      let mut guard = stream.try_borrow_mut().map_err(|_| Error::Busy)?;
      f(&mut guard)
    };
    self.reap_stream(id.0, &stream);
    Ok(out)
  }

  /// Run `f` against a live listener.
  pub fn with_listener<R>(
    &self,
    id: ListenerId,
    f: impl FnOnce(&mut Listener) -> R,
  ) -> Result<R> {
    let Some(Source::Listener(listener)) = self.source(id.0) else {
      return Err(Error::UnknownId);
    };

    let (out, closed) = {
      let mut guard = listener.try_borrow_mut().map_err(|_| Error::Busy)?;
      let out = f(&mut guard);
      (out, guard.is_closed())
    };
    if closed {
      self.remove(id.0);
    }
    Ok(out)
  }

  /// Run `f` against a live datagram endpoint.
  pub fn with_datagram<R>(
    &self,
    id: DatagramId,
    f: impl FnOnce(&mut Datagram) -> R,
  ) -> Result<R> {
    let Some(Source::Datagram(datagram)) = self.source(id.0) else {
      return Err(Error::UnknownId);
    };

    let out = {
      let mut guard = datagram.try_borrow_mut().map_err(|_| Error::Busy)?;
      f(&mut guard)
    };
    self.reap_datagram(id.0, &datagram);
    Ok(out)
  }

  /// Stop accepting and close the listening socket. Streams already
  /// accepted are not affected.
  pub fn shutdown_listener(&self, id: ListenerId) -> Result<()> {
    self.with_listener(id, Listener::close)
  }

  /// Ids of every live stream, in no particular order.
  pub fn stream_ids(&self) -> Vec<StreamId> {
    self
      .shared
      .sources
      .borrow()
      .iter()
      .filter(|(_, source)| matches!(source, Source::Stream(_)))
      .map(|(token, _)| StreamId(*token))
      .collect()
  }

  /// Number of live sources of any kind.
  pub fn len(&self) -> usize {
    self.shared.sources.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Make [`Reactor::run`] return after the current turn.
  pub fn stop(&self) {
    self.shared.stopped.set(true);
  }

  fn source(&self, key: u64) -> Option<Source> {
    self.shared.sources.borrow().get(&key).cloned()
  }

  fn insert(&self, key: u64, source: Source) {
    self.shared.sources.borrow_mut().insert(key, source);
  }

  fn remove(&self, key: u64) {
    self.disarm_deadline(key);
    let removed = self.shared.sources.borrow_mut().remove(&key);
    if removed.is_some() {
      trace!(key, "source released");
    }
    // dropped here, after the table borrow has ended
    drop(removed);
  }

  fn reap_stream(&self, key: u64, stream: &Rc<RefCell<Stream>>) {
    if stream.borrow().is_closed() {
      self.remove(key);
    }
  }

  fn reap_datagram(&self, key: u64, datagram: &Rc<RefCell<Datagram>>) {
    if datagram.borrow().is_closed() {
      self.remove(key);
    }
  }

  /// Put a freshly constructed stream into the table and, unless it is
  /// still connecting, run its `on_open`.
  fn adopt(&self, stream: Stream) -> StreamId {
    let id = stream.id();
    let open = stream.is_open();
    let stream = Rc::new(RefCell::new(stream));
    self.insert(id.0, Source::Stream(stream.clone()));

    if open {
      stream.borrow_mut().opened();
    }
    self.reap_stream(id.0, &stream);
    id
  }

  fn dispatch(&self, event: Event) -> bool {
    let Some(source) = self.source(event.key) else {
      trace!(key = event.key, "event for released source dropped");
      return false;
    };

    match source {
      Source::Listener(listener) => {
        let accepted = listener.borrow_mut().accept_one();
        if let Some(stream) = accepted {
          self.adopt(stream);
        }
      }
      Source::Stream(stream) => {
        stream.borrow_mut().ready(event.interest);
        self.reap_stream(event.key, &stream);
      }
      Source::Datagram(datagram) => {
        datagram.borrow_mut().ready(event.interest);
        self.reap_datagram(event.key, &datagram);
      }
    }
    true
  }

  fn next_deadline(&self) -> Option<Instant> {
    self.shared.deadlines.borrow().values().min().copied()
  }

  /// Close every connecting stream whose deadline is at or before `now`.
  fn expire(&self, now: Instant) -> usize {
    let expired: Vec<u64> = self
      .shared
      .deadlines
      .borrow()
      .iter()
      .filter(|(_, at)| **at <= now)
      .map(|(key, _)| *key)
      .collect();

    for key in &expired {
      self.disarm_deadline(*key);
      if let Some(Source::Stream(stream)) = self.source(*key) {
        stream.borrow_mut().connect_timed_out();
        self.reap_stream(*key, &stream);
      }
    }
    expired.len()
  }
}

/// Owns the poller and drives dispatch.
///
/// # Examples
///
/// ```rust,no_run
/// use evsock::{Callbacks, Reactor};
///
/// fn main() -> evsock::Result<()> {
///   let mut reactor = Reactor::new()?;
///
///   let echo = Callbacks::new().on_read(|stream, data| {
///     let _ = stream.send(data);
///   });
///   reactor.listen("0.0.0.0", 5555, echo)?;
///
///   reactor.run()?;
///   Ok(())
/// }
/// ```
pub struct Reactor {
  handle: Handle,
  events: Events,
}

impl Reactor {
  pub fn new() -> Result<Self> {
    Self::with_config(Config::default())
  }

  pub fn with_config(config: Config) -> Result<Self> {
    config.validate()?;

    let events = Events::with_capacity(config.event_capacity);
    let shared = Shared {
      poller: OsPoller::new()?,
      config,
      sources: RefCell::new(HashMap::new()),
      deadlines: RefCell::new(HashMap::new()),
      next_token: Cell::new(0),
      stopped: Cell::new(false),
    };
    debug!("reactor created");

    Ok(Self { handle: Handle { shared: Rc::new(shared) }, events })
  }

  pub fn handle(&self) -> Handle {
    self.handle.clone()
  }

  pub fn config(&self) -> &Config {
    self.handle.config()
  }

  /// Wait at most `timeout` (forever with `None`) for readiness, then
  /// dispatch everything that was reported. Connect deadlines shorten the
  /// wait as needed and are enforced before returning.
  ///
  /// Returns how many events (including expired deadlines) were handled.
  pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
    let timeout = match self.handle.next_deadline() {
      Some(deadline) => {
        let until = deadline.saturating_duration_since(Instant::now());
        Some(timeout.map_or(until, |t| t.min(until)))
      }
      None => timeout,
    };

    match self.events.fill(self.handle.poller(), timeout) {
      Ok(_) => {}
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => return Err(err),
    }

    let mut handled = 0;
    for event in self.events.iter() {
      if self.handle.dispatch(event) {
        handled += 1;
      }
    }
    trace!(fetched = self.events.len(), handled, "turn");

    Ok(handled + self.handle.expire(Instant::now()))
  }

  /// Dispatch until [`Handle::stop`] is called or no sources remain.
  pub fn run(&mut self) -> io::Result<()> {
    self.handle.shared.stopped.set(false);
    while !self.handle.shared.stopped.get() && !self.handle.is_empty() {
      self.run_once(None)?;
    }
    Ok(())
  }

  pub fn listen(
    &self,
    address: &str,
    port: u16,
    callbacks: Callbacks,
  ) -> Result<ListenerId> {
    self.handle.listen(address, port, callbacks)
  }

  pub fn connect(
    &self,
    host: &str,
    port: u16,
    callbacks: Callbacks,
  ) -> Result<StreamId> {
    self.handle.connect(host, port, callbacks)
  }

  pub fn start_connect(
    &self,
    host: &str,
    port: u16,
    callbacks: Callbacks,
    timeout: Duration,
  ) -> Result<StreamId> {
    self.handle.start_connect(host, port, callbacks, timeout)
  }

  pub fn bind_datagram(
    &self,
    address: &str,
    port: u16,
    on_recv: impl Fn(&mut Datagram, io::Result<(&[u8], std::net::SocketAddr)>)
    + 'static,
  ) -> Result<DatagramId> {
    self.handle.bind_datagram(address, port, on_recv)
  }

  pub fn with_stream<R>(
    &self,
    id: StreamId,
    f: impl FnOnce(&mut Stream) -> R,
  ) -> Result<R> {
    self.handle.with_stream(id, f)
  }

  pub fn with_listener<R>(
    &self,
    id: ListenerId,
    f: impl FnOnce(&mut Listener) -> R,
  ) -> Result<R> {
    self.handle.with_listener(id, f)
  }

  pub fn with_datagram<R>(
    &self,
    id: DatagramId,
    f: impl FnOnce(&mut Datagram) -> R,
  ) -> Result<R> {
    self.handle.with_datagram(id, f)
  }

  pub fn shutdown_listener(&self, id: ListenerId) -> Result<()> {
    self.handle.shutdown_listener(id)
  }
}

impl Drop for Reactor {
  fn drop(&mut self) {
    // Sources hold handles back to the reactor; emptying the table breaks
    // that cycle. Sockets close as their owners drop, without callbacks.
    let sources = std::mem::take(&mut *self.handle.shared.sources.borrow_mut());
    self.handle.shared.deadlines.borrow_mut().clear();
    debug!(sources = sources.len(), "reactor dropped");
    drop(sources);
  }
}
