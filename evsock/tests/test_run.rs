mod common;

use std::{cell::Cell, rc::Rc};

use common::*;
use evsock::{Callbacks, Config, Reactor};

#[test]
fn test_run_until_stopped() {
  init_tracing();
  let mut reactor = Reactor::new().unwrap();
  let handle = reactor.handle();

  let server = Callbacks::new().on_read({
    let handle = handle.clone();
    move |_, data| {
      if data == b"stop" {
        handle.stop();
      }
    }
  });
  let (_, addr) = listen_local(&reactor, server);

  let client = Callbacks::new().on_open(|stream| stream.send(b"stop").unwrap());
  reactor.connect("127.0.0.1", addr.port(), client).unwrap();

  reactor.run().unwrap();
  // listener plus both ends are still alive
  assert_eq!(handle.len(), 3);
}

#[test]
fn test_run_until_idle() {
  let mut reactor = Reactor::with_config(Config::from_env()).unwrap();
  let handle = reactor.handle();
  let closes = Rc::new(Cell::new(0));

  // the server hangs up on its only client and stops listening
  let server = Callbacks::new()
    .on_open(|stream| stream.close())
    .on_close({
      let handle = handle.clone();
      let closes = closes.clone();
      move |stream, _| {
        closes.set(closes.get() + 1);
        if let Some(listener) = stream.listener() {
          handle.shutdown_listener(listener).unwrap();
        }
      }
    });
  let (_, addr) = listen_local(&reactor, server);

  let client = Callbacks::new().on_close({
    let closes = closes.clone();
    move |_, reason| {
      assert_eq!(reason.to_string(), "end of stream");
      closes.set(closes.get() + 1);
    }
  });
  reactor.connect("127.0.0.1", addr.port(), client).unwrap();

  reactor.run().unwrap();
  assert!(handle.is_empty());
  assert_eq!(closes.get(), 2);
}
