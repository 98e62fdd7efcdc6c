// SPDX-License-Identifier: Apache-2.0

//! A permanent client pointed at a dead address reports failure, then
//! succeeds once a listener comes up, flushing a cached message sent while
//! disconnected as the server's first received line.

use std::cell::RefCell;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::os::unix::io::FromRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use eventdispatcher::communicator::{Communicator, ConnectionRef};
use eventdispatcher::message::wire::Message;
use eventdispatcher::permanent_connection::{PermanentConnection, StreamMode};
use eventdispatcher::stream::tcp::TcpListener;

fn run_until<F: Fn() -> bool>(reactor: &Rc<RefCell<Communicator>>, timeout: Duration, done: F) {
    let deadline = Instant::now() + timeout;
    while !done() && Instant::now() < deadline {
        reactor.borrow_mut().run_once().unwrap();
    }
}

fn pump(reactor: &Rc<RefCell<Communicator>>, iterations: usize) {
    for _ in 0..iterations {
        reactor.borrow_mut().run_once().unwrap();
    }
}

#[test]
fn reconnects_and_flushes_cached_message() {
    let reactor = Rc::new(RefCell::new(Communicator::new()));

    // Reserve a port, then close it so the first connect attempt fails.
    let probe = TcpListener::bind("probe", "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let client = PermanentConnection::new(
        "client",
        &reactor,
        vec![addr],
        StreamMode::Plain,
        20_000,
        false,
    )
    .unwrap();

    let failed = Rc::new(RefCell::new(false));
    let failed2 = failed.clone();
    client
        .borrow_mut()
        .on_connection_failed(move |_conn, _reason| *failed2.borrow_mut() = true);

    let erased: ConnectionRef = client.clone();
    reactor.borrow_mut().add_connection(erased);

    run_until(&reactor, Duration::from_secs(2), || *failed.borrow());
    assert!(*failed.borrow(), "expected the dead address to fail first");

    assert!(client
        .borrow_mut()
        .send_message(&Message::new("HELLO"), true));

    let mut listener = TcpListener::bind("revived", addr).unwrap();
    let accepted_fd: Rc<RefCell<Option<std::os::unix::io::RawFd>>> = Rc::new(RefCell::new(None));
    let accepted_fd2 = accepted_fd.clone();
    listener.on_accept(move |_listener, fd, _peer| {
        *accepted_fd2.borrow_mut() = Some(fd);
    });
    let listener_ref: ConnectionRef = Rc::new(RefCell::new(listener));
    reactor.borrow_mut().add_connection(listener_ref);

    run_until(&reactor, Duration::from_secs(2), || {
        accepted_fd.borrow().is_some()
    });
    let fd = accepted_fd.borrow_mut().take().expect("server never accepted");

    // Give the reactor a few more turns to actually flush the queued
    // message's bytes onto the now-connected socket.
    pump(&reactor, 20);

    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();

    assert!(line.starts_with("HELLO"), "first line was {line:?}");
}
