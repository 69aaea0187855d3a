//! Connected TCP streams.
//!
//! A stream moves through `Connecting -> Open -> Closing -> Closed`. Only a
//! stream started by [`Handle::start_connect`](crate::Handle::start_connect)
//! is ever `Connecting`. `Closing` is the window during which `on_close`
//! runs: the socket is still open, but sending and throttling are refused.
//!
//! Outbound bytes take a fast path straight to the socket when nothing is
//! queued; whatever the kernel does not take goes to a bounded ring buffer
//! that is flushed, oldest first, as the socket becomes writable. Write
//! interest is registered exactly while that buffer is non-empty.

use std::{
  any::Any,
  fmt, io, mem,
  net::SocketAddr,
  os::fd::AsRawFd,
};

use tracing::{debug, trace, warn};

use super::{Callbacks, socket::Socket};
use crate::{
  error::{CloseReason, SendError, duplicate, is_transient},
  reactor::{Handle, Interest, ListenerId, ReadinessPoll, StreamId},
  ring::RingBuffer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Connecting,
  Open,
  Closing,
  Closed,
}

/// Socket plus its send queue. Both are released together on close.
struct StreamIo {
  socket: Socket,
  ring: RingBuffer,
}

pub struct Stream {
  id: StreamId,
  state: State,
  io: Option<StreamIo>,
  /// Receive scratch space, reused for every read.
  scratch: Vec<u8>,
  reading: bool,
  /// What the poller currently has for this socket.
  registered: Interest,
  remote: SocketAddr,
  listener: Option<ListenerId>,
  callbacks: Callbacks,
  data: Option<Box<dyn Any>>,
  handle: Handle,
}

impl Stream {
  /// Wrap a socket returned by `accept(2)`.
  pub(crate) fn accepted(
    handle: &Handle,
    socket: Socket,
    remote: SocketAddr,
    listener: ListenerId,
    callbacks: Callbacks,
  ) -> io::Result<Self> {
    prepare(&socket)?;
    Self::register(handle, socket, remote, Some(listener), callbacks, State::Open)
  }

  /// Wrap a socket whose blocking connect already succeeded.
  pub(crate) fn connected(
    handle: &Handle,
    socket: Socket,
    remote: SocketAddr,
    callbacks: Callbacks,
  ) -> io::Result<Self> {
    prepare(&socket)?;
    Self::register(handle, socket, remote, None, callbacks, State::Open)
  }

  /// Wrap a non-blocking socket whose connect returned `EINPROGRESS`.
  pub(crate) fn connecting(
    handle: &Handle,
    socket: Socket,
    remote: SocketAddr,
    callbacks: Callbacks,
  ) -> io::Result<Self> {
    Self::register(handle, socket, remote, None, callbacks, State::Connecting)
  }

  fn register(
    handle: &Handle,
    socket: Socket,
    remote: SocketAddr,
    listener: Option<ListenerId>,
    callbacks: Callbacks,
    state: State,
  ) -> io::Result<Self> {
    let config = handle.config();
    let mut stream = Stream {
      id: StreamId(handle.next_token()),
      state,
      io: Some(StreamIo {
        socket,
        ring: RingBuffer::new(config.send_buffer_capacity),
      }),
      scratch: vec![0; config.recv_buffer_size],
      reading: true,
      registered: Interest::NONE,
      remote,
      listener,
      callbacks,
      data: None,
      handle: handle.clone(),
    };

    let want = stream.wanted_interest();
    if let Some(io) = &stream.io {
      handle.reregister(io.socket.as_raw_fd(), stream.id.0, Interest::NONE, want)?;
    }
    stream.registered = want;
    Ok(stream)
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  /// The peer's address.
  pub fn remote_addr(&self) -> SocketAddr {
    self.remote
  }

  /// The peer's IP in text form, e.g. `"127.0.0.1"`.
  pub fn remote_address(&self) -> String {
    self.remote.ip().to_string()
  }

  /// The peer's port in host byte order.
  pub fn remote_port(&self) -> u16 {
    self.remote.port()
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    match &self.io {
      Some(io) => io.socket.local_addr(),
      None => Err(closed_error()),
    }
  }

  /// The listener that accepted this stream, if any.
  pub fn listener(&self) -> Option<ListenerId> {
    self.listener
  }

  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  pub fn is_connecting(&self) -> bool {
    self.state == State::Connecting
  }

  pub fn is_open(&self) -> bool {
    self.state == State::Open
  }

  /// True once `on_close` has finished and the socket is gone.
  pub fn is_closed(&self) -> bool {
    self.state == State::Closed
  }

  /// Whether the application wants inbound data, as last set by
  /// [`block_read`](Self::block_read) / [`allow_read`](Self::allow_read).
  pub fn is_reading(&self) -> bool {
    self.reading
  }

  /// Bytes queued and not yet handed to the kernel.
  pub fn pending(&self) -> usize {
    self.io.as_ref().map_or(0, |io| io.ring.len())
  }

  pub fn send_capacity(&self) -> usize {
    self.handle.config().send_buffer_capacity
  }

  /// Replace the handlers for this stream only.
  pub fn set_callbacks(&mut self, callbacks: Callbacks) {
    self.callbacks = callbacks;
  }

  pub fn callbacks(&self) -> &Callbacks {
    &self.callbacks
  }

  /// Attach application state to this stream, replacing any earlier value.
  pub fn set_data<T: Any>(&mut self, value: T) {
    self.data = Some(Box::new(value));
  }

  pub fn data<T: Any>(&self) -> Option<&T> {
    self.data.as_deref().and_then(|d| d.downcast_ref())
  }

  pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
    self.data.as_deref_mut().and_then(|d| d.downcast_mut())
  }

  pub fn take_data<T: Any>(&mut self) -> Option<T> {
    match self.data.take()?.downcast::<T>() {
      Ok(value) => Some(*value),
      Err(other) => {
        self.data = Some(other);
        None
      }
    }
  }

  /// Queue `data` for delivery in order.
  ///
  /// With nothing already queued the bytes go straight to the socket and
  /// only the remainder the kernel did not take is buffered. If buffering
  /// that remainder would exceed the send capacity the stream is closed
  /// (`on_close` runs before this returns) and nothing of the remainder is
  /// queued. The same holds if the poller refuses write interest for it.
  pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
    if !matches!(self.state, State::Open | State::Connecting) {
      return Err(SendError::Closed);
    }
    let Some(io) = self.io.as_mut() else {
      return Err(SendError::Closed);
    };
    if data.is_empty() {
      return Ok(());
    }

    let mut sent = 0;
    if io.ring.is_empty() && self.state == State::Open {
      match io.socket.send(data) {
        Ok(n) => sent = n,
        Err(err) if is_transient(&err) => {}
        Err(err) => {
          self.close_with(CloseReason::Io(duplicate(&err)));
          return Err(SendError::Io(err));
        }
      }
    }

    let rest = &data[sent..];
    if rest.is_empty() {
      trace!(stream = %self.id, sent, "sent directly");
      return Ok(());
    }

    let queued = io.ring.len();
    let capacity = io.ring.capacity();
    if io.ring.push(rest).is_err() {
      debug!(
        stream = %self.id,
        queued,
        requested = rest.len(),
        capacity,
        "send buffer overflow"
      );
      self.close_with(CloseReason::SendBufferFull);
      return Err(SendError::BufferFull {
        queued,
        requested: rest.len(),
        capacity,
      });
    }

    trace!(stream = %self.id, sent, queued = rest.len(), "send queued");
    // without write interest the queue would never drain
    self.update_interest().map_err(SendError::Io)
  }

  /// Close the stream. `on_close` runs synchronously, then the socket is
  /// released. Closing twice is a no-op.
  pub fn close(&mut self) {
    self.close_with(CloseReason::Local);
  }

  /// Stop reading from the socket until [`allow_read`](Self::allow_read).
  /// Queued outbound data keeps flowing.
  pub fn block_read(&mut self) {
    if self.reading && self.is_active() {
      self.reading = false;
      self.sync_interest();
    }
  }

  /// Resume reading after [`block_read`](Self::block_read).
  pub fn allow_read(&mut self) {
    if !self.reading && self.is_active() {
      self.reading = true;
      self.sync_interest();
    }
  }

  fn is_active(&self) -> bool {
    matches!(self.state, State::Open | State::Connecting)
  }

  pub(crate) fn opened(&mut self) {
    if self.state != State::Open {
      return;
    }
    debug!(stream = %self.id, remote = %self.remote, "stream open");
    if let Some(on_open) = self.callbacks.open.clone() {
      on_open(self);
    }
  }

  /// Handle one readiness report. Writes are flushed before reads so a
  /// reply produced by `on_read` never overtakes older queued bytes.
  pub(crate) fn ready(&mut self, interest: Interest) {
    match self.state {
      State::Connecting => {
        if interest.is_writable() {
          self.finish_connect();
        }
      }
      State::Open => {
        if interest.is_writable() && self.registered.is_writable() {
          self.flush();
        }
        if interest.is_readable() && self.reading && self.state == State::Open {
          self.fill();
        }
      }
      State::Closing | State::Closed => {}
    }
  }

  pub(crate) fn connect_timed_out(&mut self) {
    if self.state == State::Connecting {
      debug!(stream = %self.id, remote = %self.remote, "connect timed out");
      self.close_with(CloseReason::ConnectTimedOut);
    }
  }

  fn finish_connect(&mut self) {
    let Some(io) = &self.io else { return };

    match io.socket.take_error() {
      Ok(None) => {
        self.handle.disarm_deadline(self.id.0);
        self.state = State::Open;
        self.sync_interest();
        self.opened();
      }
      Ok(Some(err)) | Err(err) => {
        debug!(stream = %self.id, remote = %self.remote, error = %err, "connect failed");
        self.close_with(CloseReason::Io(err));
      }
    }
  }

  /// One `recv` into the scratch buffer.
  fn fill(&mut self) {
    let mut scratch = mem::take(&mut self.scratch);
    let result = match &self.io {
      Some(io) => io.socket.recv(&mut scratch),
      None => Ok(0),
    };

    match result {
      Ok(0) => self.close_with(CloseReason::EndOfStream),
      Ok(n) => {
        trace!(stream = %self.id, n, "received");
        if let Some(on_read) = self.callbacks.read.clone() {
          on_read(self, &scratch[..n]);
        }
      }
      Err(err) if is_transient(&err) => {}
      Err(err) => {
        debug!(stream = %self.id, error = %err, "recv failed");
        self.close_with(CloseReason::Io(err));
      }
    }

    if !self.is_closed() {
      self.scratch = scratch;
    }
  }

  /// One `send` of the oldest contiguous run of queued bytes.
  fn flush(&mut self) {
    let Some(io) = self.io.as_mut() else { return };

    let result = match io.ring.peek() {
      [] => Ok(0),
      chunk => io.socket.send(chunk),
    };

    match result {
      Ok(n) => {
        io.ring.consume(n);
        trace!(stream = %self.id, n, left = io.ring.len(), "flushed");
        if io.ring.is_empty() {
          self.sync_interest();
        }
      }
      Err(err) if is_transient(&err) => {}
      Err(err) => {
        debug!(stream = %self.id, error = %err, "send failed");
        self.close_with(CloseReason::Io(err));
      }
    }
  }

  fn wanted_interest(&self) -> Interest {
    match (self.state, &self.io) {
      (State::Connecting, Some(_)) => Interest::WRITE,
      (State::Open, Some(io)) => {
        Interest::from_flags(self.reading, !io.ring.is_empty())
      }
      _ => Interest::NONE,
    }
  }

  /// Bring the poller registration in line with what the stream needs.
  /// Failure closes the stream.
  fn update_interest(&mut self) -> io::Result<()> {
    let want = self.wanted_interest();
    if want == self.registered {
      return Ok(());
    }
    let Some(io) = &self.io else { return Ok(()) };

    match self.handle.reregister(
      io.socket.as_raw_fd(),
      self.id.0,
      self.registered,
      want,
    ) {
      Ok(()) => {
        self.registered = want;
        Ok(())
      }
      Err(err) => {
        warn!(stream = %self.id, error = %err, "failed to update interest");
        self.close_with(CloseReason::Io(duplicate(&err)));
        Err(err)
      }
    }
  }

  /// [`update_interest`](Self::update_interest) where the caller has no
  /// error to report; `on_close` already saw it.
  fn sync_interest(&mut self) {
    let _ = self.update_interest();
  }

  /// Idempotent close: `on_close`, deregister, close the socket, free the
  /// queue. The stream object itself is released by the reactor once the
  /// current callback returns.
  pub(crate) fn close_with(&mut self, reason: CloseReason) {
    if !self.is_active() {
      return;
    }
    self.state = State::Closing;
    debug!(stream = %self.id, remote = %self.remote, %reason, "closing stream");

    if let Some(on_close) = self.callbacks.close.clone() {
      on_close(self, &reason);
    }

    self.handle.disarm_deadline(self.id.0);
    if let Some(io) = self.io.take() {
      if !self.registered.is_none() {
        if let Err(err) = self.handle.poller().delete(io.socket.as_raw_fd()) {
          trace!(stream = %self.id, error = %err, "deregister on close");
        }
      }
      let dropped = io.ring.len();
      drop(io);
      if dropped > 0 {
        debug!(stream = %self.id, dropped, "unsent bytes discarded");
      }
    }

    self.registered = Interest::NONE;
    self.reading = false;
    self.scratch = Vec::new();
    self.state = State::Closed;
  }
}

impl fmt::Debug for Stream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stream")
      .field("id", &self.id)
      .field("state", &self.state)
      .field("remote", &self.remote)
      .field("reading", &self.reading)
      .field("pending", &self.pending())
      .finish_non_exhaustive()
  }
}

fn prepare(socket: &Socket) -> io::Result<()> {
  socket.set_nonblocking()?;
  socket.set_nodelay()
}

fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "stream is closed")
}
