/// Read/write readiness of a socket.
///
/// A source registers the set it currently wants; the poller reports back
/// the set that became ready. `NONE` means "not registered at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
  bits: u8,
}

impl Interest {
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  pub const READ_AND_WRITE: Self =
    Self { bits: Self::READ.bits | Self::WRITE.bits };

  /// Build from independent read/write switches.
  pub const fn from_flags(read: bool, write: bool) -> Self {
    match (read, write) {
      (true, true) => Self::READ_AND_WRITE,
      (true, false) => Self::READ,
      (false, true) => Self::WRITE,
      (false, false) => Self::NONE,
    }
  }

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  /// Every bit of `other` is set here.
  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl std::ops::BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_roundtrip() {
    for read in [false, true] {
      for write in [false, true] {
        let interest = Interest::from_flags(read, write);
        assert_eq!(interest.is_readable(), read);
        assert_eq!(interest.is_writable(), write);
        assert_eq!(interest.is_none(), !read && !write);
      }
    }
  }

  #[test]
  fn combine() {
    let mut interest = Interest::NONE;
    interest |= Interest::WRITE;
    assert_eq!(interest | Interest::READ, Interest::READ_AND_WRITE);
    assert!(Interest::READ_AND_WRITE.contains(Interest::READ));
    assert!(!Interest::READ.contains(Interest::WRITE));
  }
}
