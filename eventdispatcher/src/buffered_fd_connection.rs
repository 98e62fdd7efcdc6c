// SPDX-License-Identifier: Apache-2.0

//! Buffered FD connection: a raw descriptor plus an output queue with a
//! write cursor and a line-framed input accumulator.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::{set_nonblocking, FdMode};

const READ_CHUNK: usize = 64 * 1024;

pub struct BufferedFdConnection {
    base: ConnectionBase,
    fd: RawFd,
    mode: FdMode,
    is_listener: bool,

    input_accum: Vec<u8>,
    output: VecDeque<u8>,

    /// Set once the caller wants the connection removed as soon as the
    /// output queue fully drains (clean shutdown after last send).
    shutdown_when_empty: bool,

    closed: bool,

    /// Invoked once per complete line (separator stripped). A data-driven
    /// callback rather than a virtual method; message-oriented connections
    /// attach a handler here that parses and dispatches.
    on_line: Option<Box<dyn FnMut(&mut BufferedFdConnection, &[u8])>>,

    /// Invoked exactly once, just before the connection reports itself
    /// removable from `process_hup`/`process_error`/`process_invalid`; lets
    /// an owner (e.g. a reconnecting client) notice the link is gone
    /// without polling `is_done()` on its own schedule.
    on_close: Option<Box<dyn FnMut()>>,
}

impl BufferedFdConnection {
    pub fn new(name: impl Into<String>, fd: RawFd, mode: FdMode) -> Result<Self> {
        if fd < 0 {
            return Err(Error::init("cannot wrap a negative file descriptor"));
        }
        set_nonblocking(fd)?;
        Ok(BufferedFdConnection {
            base: ConnectionBase::new(name),
            fd,
            mode,
            is_listener: false,
            input_accum: Vec::new(),
            output: VecDeque::new(),
            shutdown_when_empty: false,
            closed: false,
            on_line: None,
            on_close: None,
        })
    }

    pub fn set_on_line(&mut self, handler: impl FnMut(&mut BufferedFdConnection, &[u8]) + 'static) {
        self.on_line = Some(Box::new(handler));
    }

    pub fn set_on_close(&mut self, handler: impl FnMut() + 'static) {
        self.on_close = Some(Box::new(handler));
    }

    fn fire_on_close(&mut self) {
        if let Some(mut handler) = self.on_close.take() {
            handler();
        }
    }

    pub fn set_as_listener(&mut self, is_listener: bool) {
        self.is_listener = is_listener;
    }

    fn can_read(&self) -> bool {
        !self.closed && matches!(self.mode, FdMode::ReadOnly | FdMode::ReadWrite)
    }

    fn can_write(&self) -> bool {
        !self.closed && matches!(self.mode, FdMode::WriteOnly | FdMode::ReadWrite)
    }

    pub fn has_input(&self) -> bool {
        !self.input_accum.is_empty()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Appends `buf` to the output queue. Never partial: either the whole
    /// buffer is accepted (returns its length) or nothing is (returns
    /// `-1`, `EBADF`, when the descriptor is closed or the mode forbids
    /// writing).
    pub fn write(&mut self, buf: &[u8]) -> i64 {
        if !self.can_write() {
            return -1;
        }
        self.output.extend(buf.iter().copied());
        buf.len() as i64
    }

    /// Marks the connection for removal once the output queue drains.
    pub fn mark_shutdown_when_empty(&mut self) {
        self.shutdown_when_empty = true;
    }

    /// Splits off and returns every complete (`\n`-terminated, separator
    /// excluded) line currently buffered, retaining any trailing partial
    /// line.
    fn drain_lines(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        loop {
            if let Some(pos) = self.input_accum.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.input_accum.drain(..=pos).collect();
                line.pop(); // drop the '\n'
                lines.push(line);
            } else {
                break;
            }
        }
        lines
    }

    fn dispatch_line(&mut self, line: &[u8]) {
        if let Some(mut handler) = self.on_line.take() {
            handler(self, line);
            self.on_line = Some(handler);
        }
    }

    fn close(&mut self) {
        if !self.closed && self.fd >= 0 {
            let _ = nix::unistd::close(self.fd);
            self.closed = true;
        }
    }
}

impl Connection for BufferedFdConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        if self.closed {
            -1
        } else {
            self.fd
        }
    }

    fn kind(&self) -> ConnectionKind {
        if self.is_listener {
            return ConnectionKind::Listener;
        }
        match self.mode {
            FdMode::ReadOnly => ConnectionKind::Reader,
            FdMode::WriteOnly => ConnectionKind::Writer,
            FdMode::ReadWrite => ConnectionKind::ReaderWriter,
        }
    }

    fn process_read(&mut self) {
        if !self.can_read() {
            return;
        }
        let event_limit = self.event_limit() as u64;
        let time_limit_us = self.processing_time_limit_us();
        let start = Instant::now();
        let mut events_processed: u64 = 0;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if events_processed >= event_limit {
                break;
            }
            if time_limit_us != i64::MAX
                && start.elapsed().as_micros() as i64 >= time_limit_us
            {
                break;
            }

            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                self.input_accum.extend_from_slice(&buf[..n as usize]);
                for line in self.drain_lines() {
                    self.dispatch_line(&line);
                    events_processed += 1;
                    if events_processed >= event_limit {
                        break;
                    }
                }
                continue;
            }
            if n == 0 {
                // Nothing more to read; the base layer does not treat this
                // as a hangup on its own.
                break;
            }
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                break;
            }
            self.process_error();
            break;
        }
    }

    fn process_write(&mut self) -> bool {
        if !self.can_write() || self.output.is_empty() {
            return false;
        }
        let (slice_a, slice_b) = self.output.as_slices();
        let mut iovecs = [
            libc::iovec {
                iov_base: slice_a.as_ptr() as *mut libc::c_void,
                iov_len: slice_a.len(),
            },
            libc::iovec {
                iov_base: slice_b.as_ptr() as *mut libc::c_void,
                iov_len: slice_b.len(),
            },
        ];
        let iov_count = if slice_b.is_empty() { 1 } else { 2 };
        let n = unsafe { libc::writev(self.fd, iovecs.as_mut_ptr(), iov_count) };
        if n < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                return false;
            }
            return self.process_error();
        }
        for _ in 0..n {
            self.output.pop_front();
        }
        if self.output.is_empty() {
            self.process_empty_buffer();
            if self.shutdown_when_empty {
                self.close();
                return true;
            }
        }
        false
    }

    fn process_hup(&mut self) -> bool {
        self.close();
        log::debug!(target: "eventdispatcher", "connection {:?} hung up", self.name());
        self.fire_on_close();
        true
    }

    fn process_error(&mut self) -> bool {
        self.close();
        log::warn!(target: "eventdispatcher", "connection {:?} raised an error, removing", self.name());
        self.fire_on_close();
        true
    }

    fn process_invalid(&mut self) -> bool {
        self.close();
        log::warn!(target: "eventdispatcher", "connection {:?} has an invalid descriptor, removing", self.name());
        self.fire_on_close();
        true
    }
}

impl Drop for BufferedFdConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_accepts_whole_buffer_atomically() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::IntoRawFd;
        let mut conn = BufferedFdConnection::new("w", w.into_raw_fd(), FdMode::WriteOnly).unwrap();
        assert_eq!(conn.write(b"hello"), 5);
        assert!(conn.has_output());
        drop(r);
    }

    #[test]
    fn write_rejected_in_readonly_mode() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::IntoRawFd;
        let mut conn = BufferedFdConnection::new("r", r.into_raw_fd(), FdMode::ReadOnly).unwrap();
        assert_eq!(conn.write(b"x"), -1);
        drop(w);
    }

    #[test]
    fn drain_lines_keeps_partial_trailing_line() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::IntoRawFd;
        let mut conn = BufferedFdConnection::new("r", r.into_raw_fd(), FdMode::ReadOnly).unwrap();
        conn.input_accum.extend_from_slice(b"line1\nline2\npart");
        let lines = conn.drain_lines();
        assert_eq!(lines, vec![b"line1".to_vec(), b"line2".to_vec()]);
        assert_eq!(conn.input_accum, b"part");
        drop(w);
    }
}
