use crate::reactor::interest::Interest;
use crate::reactor::poll::{ReadinessPoll, duration_to_millis};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Level-triggered epoll instance.
pub struct OsPoller {
  epoll_fd: OwnedFd,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    // SAFETY: freshly created, owned by nobody else.
    Ok(Self { epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) } })
  }

  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut events = 0u32;

    if interest.is_readable() {
      events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(())
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    // a closed fd is already gone from the set
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let max = events.len().min(libc::c_int::MAX as usize) as libc::c_int;

    let n = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      max,
      duration_to_millis(timeout),
    ))?;

    Ok(n as usize)
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let flags = event.events;
    let failed = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
    let readable =
      failed || flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0;
    let writable = failed || flags & libc::EPOLLOUT as u32 != 0;

    Interest::from_flags(readable, writable)
  }
}
