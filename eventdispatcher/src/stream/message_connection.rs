// SPDX-License-Identifier: Apache-2.0

//! A "messenger": a [`BufferedFdConnection`] whose lines are parsed into
//! [`Message`]s and routed through an attached [`Dispatcher`].

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::buffered_fd_connection::BufferedFdConnection;
use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::Result;
use crate::fd_connection::FdMode;
use crate::message::dispatcher::Dispatcher;
use crate::message::wire::Message;

pub struct MessageConnection {
    inner: BufferedFdConnection,
    dispatcher: Rc<RefCell<Dispatcher>>,
}

impl MessageConnection {
    pub fn new(name: impl Into<String>, fd: RawFd, mode: FdMode) -> Result<Self> {
        let mut inner = BufferedFdConnection::new(name, fd, mode)?;
        let dispatcher = Rc::new(RefCell::new(Dispatcher::new()));
        let dispatcher_for_line = dispatcher.clone();
        inner.set_on_line(move |_conn, line| {
            let text = String::from_utf8_lossy(line);
            match crate::message::wire::parse(&format!("{text}\n")) {
                Ok(mut message) => {
                    dispatcher_for_line.borrow_mut().dispatch(&mut message);
                }
                Err(e) => {
                    log::warn!(target: "eventdispatcher", "dropping unparsable line {text:?}: {e}")
                }
            }
        });
        Ok(MessageConnection { inner, dispatcher })
    }

    /// Shared handle to the match table; callbacks registered here
    /// typically capture a `Weak<RefCell<MessageConnection>>` back to this
    /// connection so they can call [`send_message`](Self::send_message).
    pub fn dispatcher(&self) -> Rc<RefCell<Dispatcher>> {
        self.dispatcher.clone()
    }

    /// Serializes and enqueues `message`; returns whether it was accepted
    /// (false if the underlying descriptor is closed or read-only).
    pub fn send_message(&mut self, message: &Message) -> bool {
        let wire = message.serialize();
        self.inner.write(wire.as_bytes()) >= 0
    }

    pub fn mark_shutdown_when_empty(&mut self) {
        self.inner.mark_shutdown_when_empty();
    }

    /// Invoked exactly once, when the underlying descriptor hangs up,
    /// errors, or goes invalid — before the reactor removes this
    /// connection. The permanent-reconnect client uses this to notice the
    /// link dropped instead of polling.
    pub fn on_close(&mut self, callback: impl FnMut() + 'static) {
        self.inner.set_on_close(callback);
    }
}

impl Connection for MessageConnection {
    fn base(&self) -> &ConnectionBase {
        self.inner.base()
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        self.inner.base_mut()
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }

    fn kind(&self) -> ConnectionKind {
        self.inner.kind()
    }

    fn process_read(&mut self) {
        self.inner.process_read();
    }

    fn process_write(&mut self) -> bool {
        self.inner.process_write()
    }

    fn process_hup(&mut self) -> bool {
        self.inner.process_hup()
    }

    fn process_error(&mut self) -> bool {
        self.inner.process_error()
    }

    fn process_invalid(&mut self) -> bool {
        self.inner.process_invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::dispatcher::always;
    use std::cell::Cell;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn dispatches_parsed_message_to_attached_handler() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut conn = MessageConnection::new("conn", read_end.into_raw_fd(), FdMode::ReadOnly).unwrap();

        let echoed = Rc::new(Cell::new(None));
        let echoed2 = echoed.clone();
        conn.dispatcher().borrow_mut().add_match(
            "echo",
            always(),
            move |msg| {
                let mut reply = Message::new("ECHO");
                reply.parameters = msg.parameters.clone();
                echoed2.set(Some(reply));
            },
            0,
        );

        let wire = b"PING who=alice\n";
        let write_fd = write_end.into_raw_fd();
        unsafe {
            libc::write(write_fd, wire.as_ptr() as *const libc::c_void, wire.len());
        }
        unsafe {
            libc::close(write_fd);
        }

        conn.process_read();

        let reply = echoed.take().unwrap();
        assert_eq!(reply.command, "ECHO");
        assert_eq!(reply.get_string("who"), Some("alice"));
    }
}
