use std::{
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  ptr,
};

/// Convert a kernel-filled `sockaddr_storage` into a [`SocketAddr`].
pub(crate) fn to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
  match storage.ss_family as libc::c_int {
    libc::AF_INET => {
      // SAFETY: ss_family is AF_INET, so the storage holds a sockaddr_in.
      let v4 = unsafe {
        *(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
      };
      let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
      let port = u16::from_be(v4.sin_port);

      Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
    libc::AF_INET6 => {
      // SAFETY: ss_family is AF_INET6, so the storage holds a sockaddr_in6.
      let v6 = unsafe {
        *(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
      };
      let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
      let port = u16::from_be(v6.sin6_port);

      Ok(SocketAddr::V6(SocketAddrV6::new(
        ip,
        port,
        v6.sin6_flowinfo,
        v6.sin6_scope_id,
      )))
    }
    _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
  }
}

/// Convert a [`SocketAddr`] into storage plus the length the kernel expects.
pub(crate) fn from_std(
  addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: sockaddr_storage is a C struct designed to hold any socket address type.
  // Zero-initialization is valid - all fields are primitive types where zero is safe.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

  let len = match addr {
    SocketAddr::V4(v4) => {
      let raw = into_addr(v4);
      // SAFETY: sockaddr_in fits in sockaddr_storage by design and the two
      // regions do not overlap.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in,
          (&mut storage as *mut libc::sockaddr_storage).cast(),
          1,
        );
      }
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let raw = into_addr6(v6);
      // SAFETY: as above, for sockaddr_in6.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in6,
          (&mut storage as *mut libc::sockaddr_storage).cast(),
          1,
        );
      }
      mem::size_of::<libc::sockaddr_in6>()
    }
  };

  (storage, len as libc::socklen_t)
}

fn into_addr(addr: SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in is a C struct with primitive integer fields.
  let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };

  #[cfg(kqueue)]
  {
    raw.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
  }
  raw.sin_family = libc::AF_INET as libc::sa_family_t;
  raw.sin_port = addr.port().to_be();
  raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };

  raw
}

fn into_addr6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 is a C struct with primitive integer/array fields.
  let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };

  #[cfg(kqueue)]
  {
    raw.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
  }
  raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  raw.sin6_port = addr.port().to_be();
  raw.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  raw.sin6_flowinfo = addr.flowinfo();
  raw.sin6_scope_id = addr.scope_id();

  raw
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn v4_roundtrip() {
    let addr: SocketAddr = "192.168.1.20:5555".parse().unwrap();
    let (storage, len) = from_std(addr);
    assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
    assert_eq!(to_std(&storage).unwrap(), addr);
  }

  #[test]
  fn v6_roundtrip() {
    let addr: SocketAddr = "[::1]:8080".parse().unwrap();
    let (storage, len) = from_std(addr);
    assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
    assert_eq!(to_std(&storage).unwrap(), addr);
  }

  #[test]
  fn port_is_network_order_on_the_wire() {
    let (storage, _) = from_std("10.0.0.1:258".parse().unwrap());
    let raw = unsafe {
      *(&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
    };
    assert_eq!(raw.sin_port, 258u16.to_be());
  }

  #[test]
  fn unknown_family() {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
    let err = to_std(&storage).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EAFNOSUPPORT));
  }
}
