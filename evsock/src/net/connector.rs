//! Outbound connections.

use std::{io, net::SocketAddr, os::fd::AsRawFd};

use tracing::debug;

use super::{Callbacks, addr, socket::Socket, stream::Stream};
use crate::{
  error::{Error, Result},
  reactor::Handle,
};

/// Resolve `host` and try each address with a blocking `connect(2)` until
/// one succeeds. The last attempt's error is returned if none does.
pub(crate) fn connect(
  handle: &Handle,
  host: &str,
  port: u16,
  callbacks: Callbacks,
) -> Result<Stream> {
  let candidates = addr::resolve(host, port)?;
  let mut last_err = None;

  for candidate in candidates {
    match blocking_connect(candidate) {
      Ok(socket) => {
        debug!(host, remote = %candidate, "connected");
        return Ok(Stream::connected(handle, socket, candidate, callbacks)?);
      }
      Err(err) => {
        debug!(host, remote = %candidate, error = %err, "connect attempt failed");
        last_err = Some(err);
      }
    }
  }

  Err(match last_err {
    Some(err) => Error::Io(err),
    None => Error::NoAddress(host.to_owned()),
  })
}

fn blocking_connect(addr: SocketAddr) -> io::Result<Socket> {
  let socket = Socket::for_addr(&addr, libc::SOCK_STREAM)?;
  match socket.connect(addr) {
    Ok(()) => {}
    // a signal cut the wait short; the handshake itself carries on
    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
      await_connect(&socket)?;
    }
    Err(err) => return Err(err),
  }
  Ok(socket)
}

/// Block until a connect already in flight on `socket` settles, then report
/// its outcome from `SO_ERROR`.
fn await_connect(socket: &Socket) -> io::Result<()> {
  let mut pfd = libc::pollfd {
    fd: socket.as_raw_fd(),
    events: libc::POLLOUT,
    revents: 0,
  };
  loop {
    match syscall!(poll(&mut pfd, 1, -1)) {
      Ok(_) => break,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Err(err),
    }
  }

  match socket.take_error()? {
    None => Ok(()),
    Some(err) => Err(err),
  }
}

/// Start a non-blocking connect to the first resolved address the kernel
/// accepts an attempt for. Later addresses are not tried once an attempt is
/// in flight; its outcome is reported through the stream's callbacks.
pub(crate) fn start_connect(
  handle: &Handle,
  host: &str,
  port: u16,
  callbacks: Callbacks,
) -> Result<Stream> {
  let candidates = addr::resolve(host, port)?;
  let mut last_err = None;

  for candidate in candidates {
    let socket = match nonblocking_socket(&candidate) {
      Ok(socket) => socket,
      Err(err) => {
        last_err = Some(err);
        continue;
      }
    };

    match socket.connect(candidate) {
      // loopback may complete immediately
      Ok(()) => {
        debug!(host, remote = %candidate, "connected");
        return Ok(Stream::connected(handle, socket, candidate, callbacks)?);
      }
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
        debug!(host, remote = %candidate, "connect in progress");
        return Ok(Stream::connecting(handle, socket, candidate, callbacks)?);
      }
      Err(err) => {
        debug!(host, remote = %candidate, error = %err, "connect attempt failed");
        last_err = Some(err);
      }
    }
  }

  Err(match last_err {
    Some(err) => Error::Io(err),
    None => Error::NoAddress(host.to_owned()),
  })
}

fn nonblocking_socket(addr: &SocketAddr) -> io::Result<Socket> {
  let socket = Socket::for_addr(addr, libc::SOCK_STREAM)?;
  socket.set_nonblocking()?;
  socket.set_nodelay()?;
  Ok(socket)
}
