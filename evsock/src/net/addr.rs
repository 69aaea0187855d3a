use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Parse an IP literal address. Accepts IPv4/IPv6 literals, and `""`, `"*"`
/// or `"0.0.0.0"` for the IPv4 wildcard. Never touches DNS.
pub(crate) fn literal_addr(address: &str, port: u16) -> Result<SocketAddr> {
  let ip = match address.trim() {
    "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    literal => literal
      .trim_start_matches('[')
      .trim_end_matches(']')
      .parse::<IpAddr>()
      .map_err(|_| Error::InvalidAddress(address.to_owned()))?,
  };
  Ok(SocketAddr::new(ip, port))
}

/// Resolve `host:port` into every candidate address, in resolver order.
pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
  let addrs: Vec<SocketAddr> = (host, port)
    .to_socket_addrs()
    .map_err(|source| Error::Resolve { host: host.to_owned(), source })?
    .collect();

  if addrs.is_empty() {
    return Err(Error::NoAddress(host.to_owned()));
  }
  Ok(addrs)
}
