//! Fixed-capacity FIFO byte queue with wraparound indices.
//!
//! This is the outbound queue of every [`Stream`](crate::Stream) and the only
//! backpressure mechanism in the crate: a push that does not fit is refused as
//! a whole, the buffer never grows.
//!
//! Invariants, for capacity `C`:
//! - `0 <= len <= C`
//! - `start < C` and `end < C`
//! - `(end - start) mod C == len` whenever `0 < len < C` (with `len == C`,
//!   `end == start`)
//!
//! The socket side never copies out of the buffer: it asks for the longest
//! contiguous run with [`RingBuffer::peek`], hands that to `send(2)`, and
//! [`consume`](RingBuffer::consume)s exactly what the kernel accepted.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
  #[error("ring buffer full: {requested} bytes requested, {available} available")]
  Full { available: usize, requested: usize },
}

pub struct RingBuffer {
  buf: Box<[u8]>,
  start: usize,
  end: usize,
  len: usize,
}

impl RingBuffer {
  /// # Panics
  /// If `capacity` is zero.
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "ring buffer capacity must be non-zero");
    Self { buf: vec![0u8; capacity].into_boxed_slice(), start: 0, end: 0, len: 0 }
  }

  pub fn capacity(&self) -> usize {
    self.buf.len()
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Bytes that can still be pushed.
  pub fn available(&self) -> usize {
    self.capacity() - self.len
  }

  /// Append `data` at the tail. All or nothing: if `data` does not fit,
  /// nothing is written.
  pub fn push(&mut self, data: &[u8]) -> Result<(), RingError> {
    if data.len() > self.available() {
      return Err(RingError::Full {
        available: self.available(),
        requested: data.len(),
      });
    }
    if data.is_empty() {
      return Ok(());
    }

    let cap = self.capacity();
    let first = data.len().min(cap - self.end);
    self.buf[self.end..self.end + first].copy_from_slice(&data[..first]);

    let rest = &data[first..];
    self.buf[..rest.len()].copy_from_slice(rest);

    self.end = (self.end + data.len()) % cap;
    self.len += data.len();
    Ok(())
  }

  /// Longest contiguous run of queued bytes starting at the head, i.e.
  /// `min(len, capacity - start)` bytes.
  pub fn peek(&self) -> &[u8] {
    let run = self.len.min(self.capacity() - self.start);
    &self.buf[self.start..self.start + run]
  }

  /// Drop `n` bytes from the head.
  ///
  /// # Panics
  /// If `n` exceeds [`len`](Self::len).
  pub fn consume(&mut self, n: usize) {
    assert!(n <= self.len, "consume({n}) past queued length {}", self.len);
    self.start = (self.start + n) % self.capacity();
    self.len -= n;

    if self.len == 0 {
      // defragment
      self.start = 0;
      self.end = 0;
    }
  }

  /// Pop up to `max` bytes from the head, across the wraparound point.
  pub fn drain(&mut self, max: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(max.min(self.len));
    while out.len() < max && !self.is_empty() {
      let run = self.peek();
      let take = run.len().min(max - out.len());
      out.extend_from_slice(&run[..take]);
      self.consume(take);
    }
    out
  }

  #[cfg(test)]
  fn check_invariants(&self) {
    let cap = self.capacity();
    assert!(self.len <= cap);
    assert!(self.start < cap);
    assert!(self.end < cap);
    if self.len > 0 && self.len < cap {
      assert_eq!((self.end + cap - self.start) % cap, self.len);
    }
    if self.len == cap {
      assert_eq!(self.start, self.end);
    }
    if self.len == 0 {
      assert_eq!((self.start, self.end), (0, 0));
    }
  }
}

impl std::fmt::Debug for RingBuffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RingBuffer")
      .field("capacity", &self.capacity())
      .field("start", &self.start)
      .field("end", &self.end)
      .field("len", &self.len)
      .finish()
  }
}
