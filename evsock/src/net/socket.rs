//! Thin owned wrapper over a socket descriptor.
//!
//! Every call is one syscall; nothing here retries or buffers. Dropping the
//! [`Socket`] closes the descriptor, which is what makes error paths during
//! setup leak-free.

use std::{
  io, mem,
  net::SocketAddr,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use super::sockaddr;

#[cfg(linux)]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(linux))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug)]
pub(crate) struct Socket(OwnedFd);

impl AsRawFd for Socket {
  fn as_raw_fd(&self) -> RawFd {
    self.0.as_raw_fd()
  }
}

impl Socket {
  /// `socket(2)` with close-on-exec set.
  pub fn new(domain: libc::c_int, ty: libc::c_int) -> io::Result<Self> {
    #[cfg(linux)]
    let fd = syscall!(socket(domain, ty | libc::SOCK_CLOEXEC, 0))?;
    #[cfg(not(linux))]
    let fd = syscall!(socket(domain, ty, 0))?;

    // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
    let socket = Socket(unsafe { OwnedFd::from_raw_fd(fd) });

    #[cfg(not(linux))]
    socket.set_cloexec()?;
    #[cfg(apple)]
    socket.set_opt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

    Ok(socket)
  }

  /// Socket of the right family for `addr`.
  pub fn for_addr(addr: &SocketAddr, ty: libc::c_int) -> io::Result<Self> {
    let domain = match addr {
      SocketAddr::V4(_) => libc::AF_INET,
      SocketAddr::V6(_) => libc::AF_INET6,
    };
    Self::new(domain, ty)
  }

  /// # Safety
  /// `fd` must be an open socket not owned by anything else.
  unsafe fn from_raw(fd: RawFd) -> io::Result<Self> {
    // SAFETY: upheld by the caller.
    let socket = Socket(unsafe { OwnedFd::from_raw_fd(fd) });
    socket.set_cloexec()?;
    #[cfg(apple)]
    socket.set_opt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
    Ok(socket)
  }

  fn set_cloexec(&self) -> io::Result<()> {
    let flags = syscall!(fcntl(self.as_raw_fd(), libc::F_GETFD))?;
    syscall!(fcntl(self.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
  }

  pub fn set_nonblocking(&self) -> io::Result<()> {
    let flags = syscall!(fcntl(self.as_raw_fd(), libc::F_GETFL))?;
    syscall!(fcntl(self.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
  }

  fn set_opt(
    &self,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
  ) -> io::Result<()> {
    syscall!(setsockopt(
      self.as_raw_fd(),
      level,
      name,
      (&value as *const libc::c_int).cast::<libc::c_void>(),
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
  }

  pub fn set_reuseaddr(&self) -> io::Result<()> {
    self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
  }

  /// Disable Nagle's algorithm.
  pub fn set_nodelay(&self) -> io::Result<()> {
    self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
  }

  #[cfg(test)]
  pub fn nodelay(&self) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      self.as_raw_fd(),
      libc::IPPROTO_TCP,
      libc::TCP_NODELAY,
      (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
      &mut len,
    ))?;
    Ok(value != 0)
  }

  /// Pending `SO_ERROR`, which also clears it.
  pub fn take_error(&self) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      self.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
      &mut len,
    ))?;
    Ok((value != 0).then(|| io::Error::from_raw_os_error(value)))
  }

  pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr::from_std(addr);
    syscall!(bind(
      self.as_raw_fd(),
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len
    ))?;
    Ok(())
  }

  pub fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(self.as_raw_fd(), backlog))?;
    Ok(())
  }

  /// `connect(2)`. On a non-blocking socket this returns the raw
  /// `EINPROGRESS` error; the caller decides what that means.
  pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr::from_std(addr);
    syscall!(connect(
      self.as_raw_fd(),
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len
    ))?;
    Ok(())
  }

  pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
    // SAFETY: zeroed sockaddr_storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let fd = syscall!(accept(
      self.as_raw_fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len,
    ))?;

    // SAFETY: accept(2) just handed us this descriptor.
    let socket = unsafe { Socket::from_raw(fd)? };
    let addr = sockaddr::to_std(&storage)?;
    Ok((socket, addr))
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    // SAFETY: zeroed sockaddr_storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
      self.as_raw_fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len,
    ))?;
    sockaddr::to_std(&storage)
  }

  pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(
      self.as_raw_fd(),
      buf.as_mut_ptr().cast::<libc::c_void>(),
      buf.len(),
      0
    ))?;
    Ok(n as usize)
  }

  pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
      self.as_raw_fd(),
      buf.as_ptr().cast::<libc::c_void>(),
      buf.len(),
      SEND_FLAGS
    ))?;
    Ok(n as usize)
  }

  pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    // SAFETY: zeroed sockaddr_storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let n = syscall!(recvfrom(
      self.as_raw_fd(),
      buf.as_mut_ptr().cast::<libc::c_void>(),
      buf.len(),
      0,
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len,
    ))?;

    Ok((n as usize, sockaddr::to_std(&storage)?))
  }

  pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let (storage, len) = sockaddr::from_std(addr);
    let n = syscall!(sendto(
      self.as_raw_fd(),
      buf.as_ptr().cast::<libc::c_void>(),
      buf.len(),
      SEND_FLAGS,
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len,
    ))?;
    Ok(n as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::is_transient;

  fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  #[test]
  fn listen_accept_roundtrip() {
    let server = Socket::new(libc::AF_INET, libc::SOCK_STREAM).unwrap();
    server.set_reuseaddr().unwrap();
    server.bind(loopback()).unwrap();
    server.listen(16).unwrap();
    let addr = server.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let client = Socket::for_addr(&addr, libc::SOCK_STREAM).unwrap();
    client.connect(addr).unwrap();

    let (accepted, peer) = server.accept().unwrap();
    assert_eq!(peer, client.local_addr().unwrap());

    accepted.set_nodelay().unwrap();
    assert!(accepted.nodelay().unwrap());

    assert_eq!(client.send(b"ping").unwrap(), 4);
    let mut buf = [0u8; 16];
    assert_eq!(accepted.recv(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");
    assert!(accepted.take_error().unwrap().is_none());
  }

  #[test]
  fn nonblocking_recv_would_block() {
    let server = Socket::new(libc::AF_INET, libc::SOCK_STREAM).unwrap();
    server.bind(loopback()).unwrap();
    server.listen(1).unwrap();
    server.set_nonblocking().unwrap();

    let err = server.accept().unwrap_err();
    assert!(is_transient(&err), "unexpected {err:?}");
  }

  #[test]
  fn datagram_roundtrip() {
    let a = Socket::new(libc::AF_INET, libc::SOCK_DGRAM).unwrap();
    a.bind(loopback()).unwrap();
    let b = Socket::new(libc::AF_INET, libc::SOCK_DGRAM).unwrap();
    b.bind(loopback()).unwrap();

    let to = b.local_addr().unwrap();
    assert_eq!(a.send_to(b"dgram", to).unwrap(), 5);

    let mut buf = [0u8; 32];
    let (n, from) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"dgram");
    assert_eq!(from, a.local_addr().unwrap());
  }

  #[test]
  fn bind_conflict_is_an_error() {
    let a = Socket::new(libc::AF_INET, libc::SOCK_STREAM).unwrap();
    a.bind(loopback()).unwrap();
    a.listen(1).unwrap();
    let taken = a.local_addr().unwrap();

    let b = Socket::new(libc::AF_INET, libc::SOCK_STREAM).unwrap();
    let err = b.bind(taken).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
  }
}
