use std::{fmt, rc::Rc};

use super::stream::Stream;
use crate::error::CloseReason;

pub type OpenFn = dyn Fn(&mut Stream);
pub type ReadFn = dyn Fn(&mut Stream, &[u8]);
pub type CloseFn = dyn Fn(&mut Stream, &CloseReason);

/// The three per-stream event handlers. Every one is optional; a stream
/// without `on_read` still reads (and discards) so end-of-stream is noticed.
///
/// Cloning is cheap: handlers are reference counted, so a listener hands the
/// same closures to every stream it accepts.
///
/// ```rust
/// use evsock::Callbacks;
///
/// let callbacks = Callbacks::new()
///   .on_open(|stream| {
///     let _ = stream.send(b"hello\n");
///   })
///   .on_read(|stream, data| {
///     if data.starts_with(b"quit") {
///       stream.close();
///     }
///   });
/// assert!(callbacks.has_read());
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
  pub(crate) open: Option<Rc<OpenFn>>,
  pub(crate) read: Option<Rc<ReadFn>>,
  pub(crate) close: Option<Rc<CloseFn>>,
}

impl Callbacks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Runs once the stream is connected: right after accept, after a
  /// blocking connect, or when a non-blocking connect completes.
  pub fn on_open(mut self, f: impl Fn(&mut Stream) + 'static) -> Self {
    self.open = Some(Rc::new(f));
    self
  }

  /// Runs with each chunk received. The slice is only valid for the call.
  pub fn on_read(mut self, f: impl Fn(&mut Stream, &[u8]) + 'static) -> Self {
    self.read = Some(Rc::new(f));
    self
  }

  /// Runs exactly once when the stream closes, for whatever reason.
  pub fn on_close(
    mut self,
    f: impl Fn(&mut Stream, &CloseReason) + 'static,
  ) -> Self {
    self.close = Some(Rc::new(f));
    self
  }

  pub fn has_open(&self) -> bool {
    self.open.is_some()
  }

  pub fn has_read(&self) -> bool {
    self.read.is_some()
  }

  pub fn has_close(&self) -> bool {
    self.close.is_some()
  }
}

impl fmt::Debug for Callbacks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Callbacks")
      .field("open", &self.has_open())
      .field("read", &self.has_read())
      .field("close", &self.has_close())
      .finish()
  }
}
