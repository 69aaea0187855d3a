//! OS readiness polling (`epoll` on Linux, `kqueue` on BSD/Apple).
//!
//! All registrations are level-triggered: a descriptor that stays readable
//! keeps being reported until it is drained or its interest is removed.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::interest::Interest;

#[cfg(linux)]
pub(crate) use super::os::epoll::OsPoller;
#[cfg(kqueue)]
pub(crate) use super::os::kqueue::OsPoller;

/// One readiness backend per OS. Keys are opaque `u64`s chosen by the
/// caller and handed back unchanged in every event.
pub trait ReadinessPoll {
  /// `epoll_event` or `kevent`.
  type NativeEvent: Copy;

  /// Start watching `fd`. Fails if it is already watched.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Replace what `fd` is watched for.
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Stop watching `fd` entirely.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Block until something is ready or `timeout` passes; returns how many
  /// slots of `events` were written.
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize>;

  fn event_key(event: &Self::NativeEvent) -> u64;

  /// Error and hang-up conditions are reported as both readable and
  /// writable; the owner finds out what happened from its next recv/send.
  fn event_interest(event: &Self::NativeEvent) -> Interest;
}

/// A decoded readiness report.
#[derive(Debug, Clone, Copy)]
pub struct Event {
  pub key: u64,
  /// What became ready.
  pub interest: Interest,
}

type NativeEvent = <OsPoller as ReadinessPoll>::NativeEvent;

/// Reusable buffer the poller fills on every turn.
pub(crate) struct Events {
  buf: Vec<NativeEvent>,
  len: usize,
}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    // SAFETY: epoll_event and kevent are plain C structs; all-zero is valid.
    Self { buf: vec![unsafe { std::mem::zeroed() }; capacity.max(1)], len: 0 }
  }

  /// Block on `poller` for at most `timeout` and remember how many events
  /// it wrote.
  pub fn fill(
    &mut self,
    poller: &OsPoller,
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    self.len = 0;
    let n = poller.wait(&mut self.buf, timeout)?;
    assert!(n <= self.buf.len(), "poller reported more events than room");
    self.len = n;
    Ok(n)
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
    self.buf[..self.len].iter().map(|native| Event {
      key: OsPoller::event_key(native),
      interest: OsPoller::event_interest(native),
    })
  }
}

/// `kevent` timeout. Seconds saturate at `time_t::MAX`.
#[cfg_attr(linux, allow(dead_code))]
pub(crate) fn duration_to_timespec(duration: Duration) -> libc::timespec {
  libc::timespec {
    tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
    tv_nsec: duration.subsec_nanos() as libc::c_long,
  }
}

/// Milliseconds for `epoll_wait`, rounded up so a short timeout never turns
/// into a busy poll. `-1` blocks indefinitely.
#[cfg_attr(kqueue, allow(dead_code))]
pub(crate) fn duration_to_millis(timeout: Option<Duration>) -> libc::c_int {
  match timeout {
    None => -1,
    Some(t) => {
      let mut ms = t.as_millis();
      if Duration::from_millis(ms as u64) < t {
        ms += 1;
      }
      ms.min(libc::c_int::MAX as u128) as libc::c_int
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

  fn socket_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    syscall!(socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()))
      .expect("socketpair");
    for fd in fds {
      let flags = syscall!(fcntl(fd, libc::F_GETFL)).unwrap();
      syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).unwrap();
    }
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
  }

  fn write_all(fd: &OwnedFd, data: &[u8]) {
    let n = syscall!(write(
      fd.as_raw_fd(),
      data.as_ptr().cast::<libc::c_void>(),
      data.len()
    ))
    .unwrap();
    assert_eq!(n as usize, data.len());
  }

  fn poll(poller: &OsPoller, ms: u64) -> Vec<Event> {
    let mut events = Events::with_capacity(16);
    events.fill(poller, Some(Duration::from_millis(ms))).unwrap();
    events.iter().collect()
  }

  #[test]
  fn no_events_without_data() {
    let poller = OsPoller::new().unwrap();
    let (a, _b) = socket_pair();
    poller.add(a.as_raw_fd(), 1, Interest::READ).unwrap();

    assert!(poll(&poller, 10).is_empty());
  }

  #[test]
  fn read_is_level_triggered() {
    let poller = OsPoller::new().unwrap();
    let (a, b) = socket_pair();
    write_all(&b, b"hello");
    poller.add(a.as_raw_fd(), 7, Interest::READ).unwrap();

    // not drained, so it is reported again
    for _ in 0..2 {
      let events = poll(&poller, 100);
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].key, 7);
      assert!(events[0].interest.is_readable());
    }
  }

  #[test]
  fn write_ready_immediately() {
    let poller = OsPoller::new().unwrap();
    let (a, _b) = socket_pair();
    poller.add(a.as_raw_fd(), 2, Interest::WRITE).unwrap();

    let events = poll(&poller, 100);
    assert!(events.iter().any(|e| e.key == 2 && e.interest.is_writable()));
  }

  #[test]
  fn modify_switches_interest() {
    let poller = OsPoller::new().unwrap();
    let (a, _b) = socket_pair();
    poller.add(a.as_raw_fd(), 3, Interest::WRITE).unwrap();
    poller.modify(a.as_raw_fd(), 3, Interest::READ).unwrap();

    // nothing to read and write interest is gone
    assert!(poll(&poller, 10).is_empty());

    poller.modify(a.as_raw_fd(), 3, Interest::READ_AND_WRITE).unwrap();
    assert!(!poll(&poller, 100).is_empty());
  }

  #[test]
  fn delete_stops_events() {
    let poller = OsPoller::new().unwrap();
    let (a, b) = socket_pair();
    write_all(&b, b"x");
    poller.add(a.as_raw_fd(), 4, Interest::READ_AND_WRITE).unwrap();
    poller.delete(a.as_raw_fd()).unwrap();

    assert!(poll(&poller, 10).is_empty());
  }

  #[test]
  fn hangup_reports_readable() {
    let poller = OsPoller::new().unwrap();
    let (a, b) = socket_pair();
    poller.add(a.as_raw_fd(), 5, Interest::READ).unwrap();
    drop(b);

    let events = poll(&poller, 100);
    assert!(events.iter().any(|e| e.key == 5 && e.interest.is_readable()));
  }

  #[test]
  fn millis_round_up() {
    assert_eq!(duration_to_millis(None), -1);
    assert_eq!(duration_to_millis(Some(Duration::ZERO)), 0);
    assert_eq!(duration_to_millis(Some(Duration::from_micros(1))), 1);
    assert_eq!(duration_to_millis(Some(Duration::from_millis(1500))), 1500);
  }

  #[test]
  fn timespec_conversion() {
    let ts = duration_to_timespec(Duration::from_millis(1500));
    assert_eq!(ts.tv_sec, 1);
    assert_eq!(ts.tv_nsec, 500_000_000);
  }

  #[test]
  fn huge_timeouts_saturate() {
    let ts = duration_to_timespec(Duration::MAX);
    assert_eq!(ts.tv_sec, libc::time_t::MAX);
    assert!(ts.tv_sec > 0);
    assert_eq!(duration_to_millis(Some(Duration::MAX)), libc::c_int::MAX);
  }
}
