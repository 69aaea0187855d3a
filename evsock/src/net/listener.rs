use std::{any::Any, fmt, io, net::SocketAddr, os::fd::AsRawFd};

use tracing::{debug, trace, warn};

use super::{Callbacks, socket::Socket, stream::Stream};
use crate::{
  error::is_transient,
  reactor::{Handle, Interest, ListenerId, ReadinessPoll},
};

/// A listening TCP socket. Each readiness event accepts exactly one pending
/// connection, so a burst of connects is spread across loop turns.
pub struct Listener {
  id: ListenerId,
  socket: Option<Socket>,
  local_addr: SocketAddr,
  callbacks: Callbacks,
  data: Option<Box<dyn Any>>,
  handle: Handle,
}

impl Listener {
  pub(crate) fn open(
    handle: &Handle,
    addr: SocketAddr,
    callbacks: Callbacks,
  ) -> io::Result<Self> {
    let socket = Socket::for_addr(&addr, libc::SOCK_STREAM)?;
    socket.set_reuseaddr()?;
    socket.bind(addr)?;
    socket.listen(handle.config().listen_backlog)?;
    socket.set_nonblocking()?;
    let local_addr = socket.local_addr()?;

    let id = ListenerId(handle.next_token());
    handle.poller().add(socket.as_raw_fd(), id.0, Interest::READ)?;
    debug!(listener = %id, %local_addr, "listening");

    Ok(Self {
      id,
      socket: Some(socket),
      local_addr,
      callbacks,
      data: None,
      handle: handle.clone(),
    })
  }

  pub fn id(&self) -> ListenerId {
    self.id
  }

  /// The bound address, with the real port when `0` was requested.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Handlers given to connections accepted from now on. Streams already
  /// accepted keep theirs.
  pub fn set_callbacks(&mut self, callbacks: Callbacks) {
    self.callbacks = callbacks;
  }

  pub fn callbacks(&self) -> &Callbacks {
    &self.callbacks
  }

  pub fn set_data<T: Any>(&mut self, value: T) {
    self.data = Some(Box::new(value));
  }

  pub fn data<T: Any>(&self) -> Option<&T> {
    self.data.as_deref().and_then(|d| d.downcast_ref())
  }

  pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
    self.data.as_deref_mut().and_then(|d| d.downcast_mut())
  }

  pub fn is_closed(&self) -> bool {
    self.socket.is_none()
  }

  /// Stop accepting and close the socket. Idempotent.
  pub fn close(&mut self) {
    let Some(socket) = self.socket.take() else { return };
    if let Err(err) = self.handle.poller().delete(socket.as_raw_fd()) {
      trace!(listener = %self.id, error = %err, "deregister on close");
    }
    debug!(listener = %self.id, "listener closed");
  }

  /// Accept one pending connection. Failures are logged and swallowed; the
  /// listener stays up.
  pub(crate) fn accept_one(&mut self) -> Option<Stream> {
    let socket = self.socket.as_ref()?;

    let (conn, remote) = match socket.accept() {
      Ok(pair) => pair,
      Err(err)
        if is_transient(&err)
          || err.raw_os_error() == Some(libc::ECONNABORTED) =>
      {
        trace!(listener = %self.id, error = %err, "nothing to accept");
        return None;
      }
      Err(err) => {
        warn!(listener = %self.id, error = %err, "accept failed");
        return None;
      }
    };

    match Stream::accepted(
      &self.handle,
      conn,
      remote,
      self.id,
      self.callbacks.clone(),
    ) {
      Ok(stream) => {
        debug!(listener = %self.id, stream = %stream.id(), %remote, "accepted");
        Some(stream)
      }
      Err(err) => {
        warn!(listener = %self.id, %remote, error = %err, "dropping accepted connection");
        None
      }
    }
  }
}

impl fmt::Debug for Listener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Listener")
      .field("id", &self.id)
      .field("local_addr", &self.local_addr)
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}
