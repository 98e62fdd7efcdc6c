// SPDX-License-Identifier: Apache-2.0

//! A one-byte wakeup descriptor: a worker thread writes a single byte to
//! signal the reactor thread it is ready to be joined.

use std::os::unix::io::{IntoRawFd, RawFd};

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::set_nonblocking;

/// The write side, handed to a worker thread. `Send` so it can cross the
/// thread boundary; writing is a single `write(2)` of one byte.
pub struct ThreadDoneSignal {
    fd: RawFd,
}

unsafe impl Send for ThreadDoneSignal {}

impl ThreadDoneSignal {
    /// Wakes the reactor. Safe to call more than once; extra bytes are
    /// drained and ignored by the reader side.
    pub fn signal(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for ThreadDoneSignal {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl Clone for ThreadDoneSignal {
    /// Duplicates the underlying write descriptor so both copies can be
    /// closed independently without the pipe reporting end-of-file while
    /// any one of them is still open.
    fn clone(&self) -> Self {
        let fd = unsafe { libc::dup(self.fd) };
        ThreadDoneSignal { fd }
    }
}

/// The read side, registered with the reactor. On readiness, drains every
/// pending byte then invokes the callback once — the caller is expected to
/// join its worker thread from inside that callback, which both reaps the
/// thread and establishes the memory barrier needed to observe its last
/// writes.
pub struct ThreadDone {
    base: ConnectionBase,
    read_fd: RawFd,
    on_done: Option<Box<dyn FnMut(&mut ThreadDone)>>,
}

/// Creates the underlying pipe without wrapping the read side in a
/// [`ThreadDone`] connection, for callers (e.g. the permanent-reconnect
/// client) that fold the read descriptor into a connection type of their
/// own rather than registering a standalone `ThreadDone`.
pub(crate) fn raw_pair() -> Result<(RawFd, ThreadDoneSignal)> {
    let (read_end, write_end) = nix::unistd::pipe().map_err(|e| Error::from_errno("pipe", e))?;
    let read_fd = read_end.into_raw_fd();
    let write_fd = write_end.into_raw_fd();
    set_nonblocking(read_fd)?;
    Ok((read_fd, ThreadDoneSignal { fd: write_fd }))
}

/// Drains every pending byte on a non-blocking read descriptor shared by
/// [`ThreadDone`] and the permanent-reconnect client's worker-done pipe.
pub(crate) fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl ThreadDone {
    /// Returns the reactor-side connection and the thread-side signaler.
    pub fn new(name: impl Into<String>) -> Result<(Self, ThreadDoneSignal)> {
        let (read_fd, signal) = raw_pair()?;
        Ok((
            ThreadDone {
                base: ConnectionBase::new(name),
                read_fd,
                on_done: None,
            },
            signal,
        ))
    }

    pub fn on_done(&mut self, callback: impl FnMut(&mut ThreadDone) + 'static) {
        self.on_done = Some(Box::new(callback));
    }

    fn drain(&self) {
        drain_pipe(self.read_fd);
    }
}

impl Connection for ThreadDone {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.read_fd
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Reader
    }

    fn process_read(&mut self) {
        self.drain();
        if let Some(mut callback) = self.on_done.take() {
            callback(self);
            self.on_done = Some(callback);
        }
    }
}

impl Drop for ThreadDone {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.read_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{Communicator, ConnectionRef};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn signal_wakes_reactor_once() {
        let (mut done, signal) = ThreadDone::new("done").unwrap();
        let woke = Rc::new(Cell::new(false));
        let woke2 = woke.clone();
        done.on_done(move |d| {
            woke2.set(true);
            d.mark_done();
        });
        let conn: ConnectionRef = Rc::new(RefCell::new(done));
        let mut reactor = Communicator::new();
        reactor.add_connection(conn);

        let handle = std::thread::spawn(move || {
            signal.signal();
        });
        reactor.run().unwrap();
        handle.join().unwrap();
        assert!(woke.get());
    }
}
