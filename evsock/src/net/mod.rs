//! Sockets driven by the reactor.

pub(crate) mod addr;
mod callbacks;
pub(crate) mod connector;
mod datagram;
mod listener;
mod sockaddr;
mod socket;
mod stream;

pub use callbacks::{Callbacks, CloseFn, OpenFn, ReadFn};
pub use datagram::{Datagram, RecvFn};
pub use listener::Listener;
pub use stream::Stream;
