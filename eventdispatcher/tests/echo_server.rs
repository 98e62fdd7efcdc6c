// SPDX-License-Identifier: Apache-2.0

//! One TCP listener accepts a connection, wraps it in a message connection
//! that echoes every command back as `ECHO` with the same parameters.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use eventdispatcher::communicator::{Communicator, ConnectionRef};
use eventdispatcher::fd_connection::FdMode;
use eventdispatcher::message::dispatcher::always;
use eventdispatcher::message::wire::Message;
use eventdispatcher::stream::message_connection::MessageConnection;
use eventdispatcher::stream::tcp::TcpListener;

#[test]
fn client_ping_gets_echoed_reply() {
    let mut listener = TcpListener::bind("echo-listener", "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let reactor = Rc::new(RefCell::new(Communicator::new()));
    let reactor_for_accept = reactor.clone();
    listener.on_accept(move |_listener, fd, _peer| {
        let conn = MessageConnection::new("echo-conn", fd, FdMode::ReadWrite).unwrap();
        let typed = Rc::new(RefCell::new(conn));
        let self_weak = Rc::downgrade(&typed);
        typed.borrow_mut().dispatcher().borrow_mut().add_match(
            "echo-reply",
            always(),
            move |msg: &mut Message| {
                if let Some(strong) = self_weak.upgrade() {
                    let mut reply = Message::new("ECHO");
                    reply.parameters = msg.parameters.clone();
                    strong.borrow_mut().send_message(&reply);
                }
            },
            0,
        );
        let erased: ConnectionRef = typed;
        reactor_for_accept.borrow_mut().add_connection(erased);
    });
    let listener_ref: ConnectionRef = Rc::new(RefCell::new(listener));
    reactor.borrow_mut().add_connection(listener_ref);

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"PING who=alice\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_finished() && Instant::now() < deadline {
        reactor.borrow_mut().run_once().unwrap();
    }

    let line = client.join().unwrap();
    let reply = eventdispatcher::message::wire::parse(&line).unwrap();
    assert_eq!(reply.command, "ECHO");
    assert_eq!(reply.get_string("who"), Some("alice"));
}
