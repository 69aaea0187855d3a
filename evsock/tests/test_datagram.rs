mod common;

use std::net::{SocketAddr, UdpSocket};

use common::*;
use evsock::{Error, Reactor};

#[test]
fn test_datagram_receive_with_sender() {
  init_tracing();
  let mut reactor = Reactor::new().unwrap();
  let got = log::<(Vec<u8>, SocketAddr)>();

  let id = reactor
    .bind_datagram("127.0.0.1", 0, {
      let got = got.clone();
      move |_, result| {
        let (data, from) = result.unwrap();
        got.borrow_mut().push((data.to_vec(), from));
      }
    })
    .unwrap();
  let addr = reactor.with_datagram(id, |d| d.local_addr()).unwrap();
  assert_ne!(addr.port(), 0);

  let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
  sender.send_to(b"one", addr).unwrap();
  sender.send_to(b"two", addr).unwrap();

  run_until(&mut reactor, || got.borrow().len() == 2);
  let got = got.borrow();
  assert_eq!(got[0], (b"one".to_vec(), sender.local_addr().unwrap()));
  assert_eq!(got[1].0, b"two");
}

#[test]
fn test_datagram_echo_between_endpoints() {
  let mut reactor = Reactor::new().unwrap();
  let replies = log::<Vec<u8>>();

  let server = reactor
    .bind_datagram("127.0.0.1", 0, |dgram, result| {
      let (data, from) = result.unwrap();
      let n = dgram.send_to_addr(data, from).unwrap();
      assert_eq!(n, data.len());
    })
    .unwrap();
  let server_addr = reactor.with_datagram(server, |d| d.local_addr()).unwrap();

  let client = reactor
    .bind_datagram("127.0.0.1", 0, {
      let replies = replies.clone();
      move |_, result| replies.borrow_mut().push(result.unwrap().0.to_vec())
    })
    .unwrap();

  let sent = reactor
    .with_datagram(client, |d| {
      d.send_to(b"marco", "127.0.0.1", server_addr.port())
    })
    .unwrap()
    .unwrap();
  assert_eq!(sent, 5);

  run_until(&mut reactor, || !replies.borrow().is_empty());
  assert_eq!(replies.borrow()[0], b"marco");
}

#[test]
fn test_datagram_send_to_unbound_port() {
  let reactor = Reactor::new().unwrap();
  let id = reactor.bind_datagram("127.0.0.1", 0, |_, _| {}).unwrap();

  // connectionless: nobody listening is not the sender's problem
  let free = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
  let sent = reactor
    .with_datagram(id, |d| d.send_to(b"void", "127.0.0.1", free.port()))
    .unwrap()
    .unwrap();
  assert_eq!(sent, 4);
}

#[test]
fn test_datagram_send_to_invalid_address() {
  let reactor = Reactor::new().unwrap();
  let id = reactor.bind_datagram("127.0.0.1", 0, |_, _| {}).unwrap();

  let err = reactor
    .with_datagram(id, |d| d.send_to(b"x", "not an address", 1))
    .unwrap()
    .unwrap_err();
  assert!(matches!(err, Error::InvalidAddress(_)));
}

#[test]
fn test_datagram_close() {
  let mut reactor = Reactor::new().unwrap();
  let got = log::<Vec<u8>>();
  let id = reactor
    .bind_datagram("127.0.0.1", 0, {
      let got = got.clone();
      move |_, result| got.borrow_mut().push(result.unwrap().0.to_vec())
    })
    .unwrap();
  let addr = reactor.with_datagram(id, |d| d.local_addr()).unwrap();

  let after_close = reactor
    .with_datagram(id, |d| {
      d.close();
      d.close();
      d.send_to_addr(b"x", addr)
    })
    .unwrap();
  assert_eq!(
    after_close.unwrap_err().kind(),
    std::io::ErrorKind::NotConnected
  );
  assert!(matches!(
    reactor.with_datagram(id, |_| ()),
    Err(Error::UnknownId)
  ));

  let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
  let _ = sender.send_to(b"late", addr);
  idle(&mut reactor, 5);
  assert!(got.borrow().is_empty());
}

#[test]
fn test_datagram_bind_conflict() {
  let reactor = Reactor::new().unwrap();
  let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
  let port = taken.local_addr().unwrap().port();

  let err = reactor.bind_datagram("127.0.0.1", port, |_, _| {}).unwrap_err();
  assert!(matches!(
    err,
    Error::Io(e) if e.raw_os_error() == Some(libc::EADDRINUSE)
  ));
  assert!(reactor.handle().is_empty());
}

#[test]
fn test_datagram_replace_handler() {
  let mut reactor = Reactor::new().unwrap();
  let first = log::<Vec<u8>>();
  let second = log::<Vec<u8>>();

  let id = reactor
    .bind_datagram("127.0.0.1", 0, {
      let first = first.clone();
      move |_, result| first.borrow_mut().push(result.unwrap().0.to_vec())
    })
    .unwrap();
  let addr = reactor.with_datagram(id, |d| d.local_addr()).unwrap();

  let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
  sender.send_to(b"before", addr).unwrap();
  run_until(&mut reactor, || first.borrow().len() == 1);

  reactor
    .with_datagram(id, |d| {
      let second = second.clone();
      d.set_on_recv(move |_, result| {
        second.borrow_mut().push(result.unwrap().0.to_vec())
      });
    })
    .unwrap();

  sender.send_to(b"after", addr).unwrap();
  run_until(&mut reactor, || second.borrow().len() == 1);
  assert_eq!(*first.borrow(), vec![b"before".to_vec()]);
  assert_eq!(*second.borrow(), vec![b"after".to_vec()]);
}
