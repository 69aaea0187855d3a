//! Reactor configuration

use tracing::warn;

use crate::error::{Error, Result};

/// Default send buffer capacity per stream, in bytes.
pub const DEFAULT_SEND_BUFFER: usize = 4096;
/// Default receive scratch size. Fits one 1500-byte MTU packet.
pub const DEFAULT_RECV_BUFFER: usize = 2048;
/// Default number of readiness events fetched per turn.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a [`Reactor`](crate::Reactor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Capacity of each stream's outbound ring buffer. A send that would
  /// queue more than this closes the stream.
  pub send_buffer_capacity: usize,

  /// Size of the scratch buffer a single receive reads into.
  pub recv_buffer_size: usize,

  /// Maximum events returned by one wait on the poller.
  pub event_capacity: usize,

  /// Backlog passed to `listen(2)`.
  pub listen_backlog: i32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      send_buffer_capacity: DEFAULT_SEND_BUFFER,
      recv_buffer_size: DEFAULT_RECV_BUFFER,
      event_capacity: DEFAULT_EVENT_CAPACITY,
      listen_backlog: libc::SOMAXCONN,
    }
  }
}

impl Config {
  pub fn new() -> Self {
    Self::default()
  }

  /// Defaults overlaid with `EVSOCK_SEND_BUFFER`, `EVSOCK_RECV_BUFFER`,
  /// `EVSOCK_EVENT_CAPACITY` and `EVSOCK_BACKLOG`.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();

    if let Some(v) = parse_var(&lookup, "EVSOCK_SEND_BUFFER") {
      config.send_buffer_capacity = v;
    }
    if let Some(v) = parse_var(&lookup, "EVSOCK_RECV_BUFFER") {
      config.recv_buffer_size = v;
    }
    if let Some(v) = parse_var(&lookup, "EVSOCK_EVENT_CAPACITY") {
      config.event_capacity = v;
    }
    if let Some(v) = parse_var(&lookup, "EVSOCK_BACKLOG") {
      config.listen_backlog = v;
    }

    config
  }

  /// Set the per-stream send buffer capacity
  pub fn send_buffer_capacity(mut self, bytes: usize) -> Self {
    self.send_buffer_capacity = bytes;
    self
  }

  /// Set the receive scratch buffer size
  pub fn recv_buffer_size(mut self, bytes: usize) -> Self {
    self.recv_buffer_size = bytes;
    self
  }

  /// Set how many events one poll returns at most
  pub fn event_capacity(mut self, n: usize) -> Self {
    self.event_capacity = n;
    self
  }

  /// Set the listen backlog
  pub fn listen_backlog(mut self, backlog: i32) -> Self {
    self.listen_backlog = backlog;
    self
  }

  /// Validate configuration
  pub fn validate(&self) -> Result<()> {
    if self.send_buffer_capacity == 0 {
      return Err(Error::InvalidConfig("send_buffer_capacity must be at least 1"));
    }
    if self.recv_buffer_size == 0 {
      return Err(Error::InvalidConfig("recv_buffer_size must be at least 1"));
    }
    if self.event_capacity == 0 {
      return Err(Error::InvalidConfig("event_capacity must be at least 1"));
    }
    if self.listen_backlog < 0 {
      return Err(Error::InvalidConfig("listen_backlog must not be negative"));
    }
    Ok(())
  }
}

fn parse_var<T: std::str::FromStr>(
  lookup: &impl Fn(&str) -> Option<String>,
  key: &str,
) -> Option<T> {
  let raw = lookup(key)?;
  match raw.trim().parse() {
    Ok(v) => Some(v),
    Err(_) => {
      warn!(key, value = %raw, "ignoring unparsable environment override");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn defaults_are_valid() {
    let config = Config::default();
    assert_eq!(config.send_buffer_capacity, 4096);
    assert_eq!(config.recv_buffer_size, 2048);
    assert_eq!(config.listen_backlog, libc::SOMAXCONN);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn builder_and_validate() {
    let config = Config::new().send_buffer_capacity(0);
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

    let config = Config::new().recv_buffer_size(0);
    assert!(config.validate().is_err());

    let config = Config::new().event_capacity(8).listen_backlog(16);
    assert_eq!(config.event_capacity, 8);
    assert_eq!(config.listen_backlog, 16);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn env_overrides() {
    let vars: HashMap<&str, &str> = [
      ("EVSOCK_SEND_BUFFER", "128"),
      ("EVSOCK_RECV_BUFFER", " 512 "),
      ("EVSOCK_EVENT_CAPACITY", "lots"),
    ]
    .into_iter()
    .collect();

    let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
    assert_eq!(config.send_buffer_capacity, 128);
    assert_eq!(config.recv_buffer_size, 512);
    // unparsable values keep the default
    assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    assert_eq!(config.listen_backlog, libc::SOMAXCONN);
  }
}
