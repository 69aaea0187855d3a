use crate::reactor::interest::Interest;
use crate::reactor::poll::{ReadinessPoll, duration_to_timespec};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, mem, ptr};

/// Read and write are separate filters. Both are always registered once a
/// descriptor is added; a filter that is not wanted is kept `EV_DISABLE`d so
/// that `modify` never has to know what was there before.
pub struct OsPoller {
  kq_fd: OwnedFd,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let fd = syscall!(kqueue())?;
    // SAFETY: freshly created, owned by nobody else.
    let kq_fd = unsafe { OwnedFd::from_raw_fd(fd) };
    syscall!(fcntl(kq_fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

    Ok(Self { kq_fd })
  }

  fn change(&self, changes: &[libc::kevent]) -> io::Result<()> {
    syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as _,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    Ok(())
  }

  fn set_interest(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let toggle = |on: bool| {
      (libc::EV_ADD | if on { libc::EV_ENABLE } else { libc::EV_DISABLE })
        as u32
    };

    self.change(&[
      kevent(fd, libc::EVFILT_READ as i64, toggle(interest.is_readable()), key),
      kevent(
        fd,
        libc::EVFILT_WRITE as i64,
        toggle(interest.is_writable()),
        key,
      ),
    ])
  }
}

fn kevent(fd: RawFd, filter: i64, flags: u32, key: u64) -> libc::kevent {
  // SAFETY: kevent is a plain C struct; zero is valid for every field.
  let mut kev: libc::kevent = unsafe { mem::zeroed() };
  kev.ident = fd as _;
  kev.filter = filter as _;
  kev.flags = flags as _;
  kev.udata = key as _;
  kev
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.set_interest(fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.set_interest(fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    self.change(&[
      kevent(fd, libc::EVFILT_READ as i64, libc::EV_DELETE as u32, 0),
      kevent(fd, libc::EVFILT_WRITE as i64, libc::EV_DELETE as u32, 0),
    ])
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout = timeout.map(duration_to_timespec);

    let n = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as _,
      timeout.as_ref().map(|t| t as *const _).unwrap_or(ptr::null()),
    ))?;

    Ok(n as usize)
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    if (event.flags as u32) & (libc::EV_EOF | libc::EV_ERROR) as u32 != 0 {
      return Interest::READ_AND_WRITE;
    }

    match event.filter {
      libc::EVFILT_READ => Interest::READ,
      libc::EVFILT_WRITE => Interest::WRITE,
      _ => Interest::NONE,
    }
  }
}
