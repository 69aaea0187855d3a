#![allow(dead_code)]

use std::{
  cell::RefCell,
  io::{self, Read},
  net::{SocketAddr, TcpListener, TcpStream},
  rc::Rc,
  time::{Duration, Instant},
};

use evsock::{Callbacks, ListenerId, Reactor};

pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
  Rc::new(RefCell::new(Vec::new()))
}

/// `RUST_LOG=evsock=trace cargo test` shows the reactor's view.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Turn the loop until `done` holds, failing after five seconds.
pub fn run_until(reactor: &mut Reactor, mut done: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !done() {
    assert!(Instant::now() < deadline, "condition not reached in time");
    reactor.run_once(Some(Duration::from_millis(10))).unwrap();
  }
}

/// A few turns with nothing expected to happen.
pub fn idle(reactor: &mut Reactor, turns: usize) {
  for _ in 0..turns {
    reactor.run_once(Some(Duration::from_millis(5))).unwrap();
  }
}

pub fn listen_local(
  reactor: &Reactor,
  callbacks: Callbacks,
) -> (ListenerId, SocketAddr) {
  let id = reactor.listen("127.0.0.1", 0, callbacks).unwrap();
  let addr = reactor.with_listener(id, |l| l.local_addr()).unwrap();
  (id, addr)
}

pub fn peer(addr: SocketAddr) -> TcpStream {
  let stream = TcpStream::connect(addr).unwrap();
  stream.set_nonblocking(true).unwrap();
  stream
}

/// Read from `peer` while turning the loop until `n` bytes arrived or the
/// peer saw end-of-stream.
pub fn read_n(reactor: &mut Reactor, peer: &mut TcpStream, n: usize) -> Vec<u8> {
  let deadline = Instant::now() + Duration::from_secs(5);
  let mut out = Vec::new();
  let mut buf = vec![0u8; 64 * 1024];

  while out.len() < n {
    assert!(Instant::now() < deadline, "got {} of {n} bytes", out.len());
    reactor.run_once(Some(Duration::from_millis(1))).unwrap();
    match peer.read(&mut buf) {
      Ok(0) => break,
      Ok(k) => out.extend_from_slice(&buf[..k]),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
      Err(err) => panic!("peer read failed: {err}"),
    }
  }
  out
}

/// True once `peer` reads end-of-stream.
pub fn saw_eof(reactor: &mut Reactor, peer: &mut TcpStream) -> bool {
  let deadline = Instant::now() + Duration::from_secs(5);
  let mut buf = [0u8; 1024];
  while Instant::now() < deadline {
    reactor.run_once(Some(Duration::from_millis(1))).unwrap();
    match peer.read(&mut buf) {
      Ok(0) => return true,
      Ok(_) => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
      Err(_) => return true,
    }
  }
  false
}

/// A loopback port nothing listens on.
pub fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}
