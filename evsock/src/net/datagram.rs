use std::{
  any::Any, fmt, io, mem, net::SocketAddr, os::fd::AsRawFd, rc::Rc,
};

use tracing::{debug, trace};

use super::{addr, socket::Socket};
use crate::{
  error::{Result, is_transient},
  reactor::{DatagramId, Handle, Interest, ReadinessPoll},
};

/// Receive handler: one datagram with its sender, or the receive error.
pub type RecvFn = dyn Fn(&mut Datagram, io::Result<(&[u8], SocketAddr)>);

/// A bound UDP endpoint. Sends are unbuffered; receives are delivered one
/// datagram per readiness event.
pub struct Datagram {
  id: DatagramId,
  socket: Option<Socket>,
  local_addr: SocketAddr,
  on_recv: Option<Rc<RecvFn>>,
  scratch: Vec<u8>,
  data: Option<Box<dyn Any>>,
  handle: Handle,
}

impl Datagram {
  pub(crate) fn bind(
    handle: &Handle,
    addr: SocketAddr,
    on_recv: Option<Rc<RecvFn>>,
  ) -> io::Result<Self> {
    let socket = Socket::for_addr(&addr, libc::SOCK_DGRAM)?;
    socket.set_nonblocking()?;
    socket.bind(addr)?;
    let local_addr = socket.local_addr()?;

    let id = DatagramId(handle.next_token());
    handle.poller().add(socket.as_raw_fd(), id.0, Interest::READ)?;
    debug!(datagram = %id, %local_addr, "bound");

    Ok(Self {
      id,
      socket: Some(socket),
      local_addr,
      on_recv,
      scratch: vec![0; handle.config().recv_buffer_size],
      data: None,
      handle: handle.clone(),
    })
  }

  pub fn id(&self) -> DatagramId {
    self.id
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  pub fn set_on_recv(
    &mut self,
    f: impl Fn(&mut Datagram, io::Result<(&[u8], SocketAddr)>) + 'static,
  ) {
    self.on_recv = Some(Rc::new(f));
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

  /// Send one datagram to `address:port`, where `address` is an IP literal.
  /// Returns the number of bytes the kernel accepted.
  pub fn send_to(&self, buf: &[u8], address: &str, port: u16) -> Result<usize> {
    let to = addr::literal_addr(address, port)?;
    Ok(self.send_to_addr(buf, to)?)
  }

  pub fn send_to_addr(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
    let socket = self.socket.as_ref().ok_or_else(|| {
      io::Error::new(io::ErrorKind::NotConnected, "datagram endpoint is closed")
    })?;
    let n = socket.send_to(buf, to)?;
    trace!(datagram = %self.id, %to, n, "sent");
    Ok(n)
  }

  pub fn is_closed(&self) -> bool {
    self.socket.is_none()
  }

  /// Deregister and close the socket. Idempotent.
  pub fn close(&mut self) {
    let Some(socket) = self.socket.take() else { return };
    if let Err(err) = self.handle.poller().delete(socket.as_raw_fd()) {
      trace!(datagram = %self.id, error = %err, "deregister on close");
    }
    debug!(datagram = %self.id, "closed");
  }

  /// One `recvfrom`. Non-transient errors go to the handler; the endpoint
  /// stays open.
  pub(crate) fn ready(&mut self, interest: Interest) {
    if !interest.is_readable() {
      return;
    }
    let Some(socket) = &self.socket else { return };

    let mut scratch = mem::take(&mut self.scratch);
    let result = socket.recv_from(&mut scratch);
    let on_recv = self.on_recv.clone();

    match result {
      Ok((n, from)) => {
        trace!(datagram = %self.id, %from, n, "received");
        if let Some(on_recv) = on_recv {
          on_recv(self, Ok((&scratch[..n], from)));
        }
      }
      Err(err) if is_transient(&err) => {}
      Err(err) => {
        debug!(datagram = %self.id, error = %err, "recvfrom failed");
        if let Some(on_recv) = on_recv {
          on_recv(self, Err(err));
        }
      }
    }
    self.scratch = scratch;
  }
}

impl fmt::Debug for Datagram {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Datagram")
      .field("id", &self.id)
      .field("local_addr", &self.local_addr)
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}
