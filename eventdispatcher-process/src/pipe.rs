// SPDX-License-Identifier: Apache-2.0

//! OS pipe plumbing for the pipeline: a thin wrapper around `pipe(2)`, and
//! the tee connection used when a node's output feeds more than one next
//! node.

use std::cell::RefCell;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

use nix::fcntl::OFlag;

use eventdispatcher::buffered_fd_connection::BufferedFdConnection;
use eventdispatcher::connection::{Connection, ConnectionBase, ConnectionKind};
use eventdispatcher::fd_connection::set_nonblocking;

use crate::error::Result;

const READ_CHUNK: usize = 64 * 1024;

/// Creates a `pipe(2)` pair, returning `(read_fd, write_fd)` as raw
/// descriptors the caller is responsible for closing or handing to a
/// forked child.
///
/// Both ends are opened `O_CLOEXEC`: a child that inherits one across
/// `fork()` only keeps it open because the pipeline explicitly `dup2`s it
/// onto 0/1/2 first, so `execvpe` closes every other pipe fd on its own
/// without the parent needing to enumerate and close them by hand.
pub fn new_os_pipe() -> Result<(RawFd, RawFd)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((read_end.into_raw_fd(), write_end.into_raw_fd()))
}

/// Reads a node's single output stream and fans it out, byte for byte, to
/// every next node's input pipe.
///
/// Sits on the parent side only: the node whose output this is writes into
/// `source_fd` across the fork, and each sink wraps the write end of one
/// next node's input pipe. Reuses [`BufferedFdConnection`]'s output queue
/// for the fan-out writes rather than writing `source_fd`'s bytes directly,
/// so a slow sink never blocks the others.
pub struct TeeSource {
    base: ConnectionBase,
    source_fd: RawFd,
    sinks: Vec<Rc<RefCell<BufferedFdConnection>>>,
}

impl TeeSource {
    pub fn new(
        name: impl Into<String>,
        source_fd: RawFd,
        sinks: Vec<Rc<RefCell<BufferedFdConnection>>>,
    ) -> Result<Self> {
        set_nonblocking(source_fd)?;
        Ok(TeeSource {
            base: ConnectionBase::new(name),
            source_fd,
            sinks,
        })
    }

    fn fan_out(&mut self, chunk: &[u8]) {
        for sink in &self.sinks {
            sink.borrow_mut().write(chunk);
        }
    }

    fn finish(&mut self) {
        for sink in &self.sinks {
            sink.borrow_mut().mark_shutdown_when_empty();
        }
        self.mark_done();
    }
}

impl Connection for TeeSource {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.source_fd
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Reader
    }

    fn process_read(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = unsafe {
                libc::read(self.source_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                self.fan_out(&buf[..n as usize]);
                continue;
            }
            if n == 0 {
                self.finish();
                break;
            }
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                break;
            }
            self.finish();
            break;
        }
    }

    fn process_hup(&mut self) -> bool {
        self.finish();
        true
    }

    fn process_error(&mut self) -> bool {
        self.finish();
        true
    }
}

impl Drop for TeeSource {
    fn drop(&mut self) {
        if self.source_fd >= 0 {
            let _ = nix::unistd::close(self.source_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventdispatcher::fd_connection::FdMode;

    #[test]
    fn new_os_pipe_returns_distinct_fds() {
        let (r, w) = new_os_pipe().unwrap();
        assert_ne!(r, w);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn fan_out_writes_to_every_sink() {
        let (r1, w1) = new_os_pipe().unwrap();
        let (r2, w2) = new_os_pipe().unwrap();
        let sink1 = Rc::new(RefCell::new(
            BufferedFdConnection::new("sink1", w1, FdMode::WriteOnly).unwrap(),
        ));
        let sink2 = Rc::new(RefCell::new(
            BufferedFdConnection::new("sink2", w2, FdMode::WriteOnly).unwrap(),
        ));
        let (src_r, src_w) = new_os_pipe().unwrap();
        let mut tee = TeeSource::new("tee", src_r, vec![sink1.clone(), sink2.clone()]).unwrap();
        tee.fan_out(b"hello");
        assert!(sink1.borrow().has_output());
        assert!(sink2.borrow().has_output());
        unsafe { libc::close(src_w) };
        drop(tee);
        unsafe {
            libc::close(r1);
            libc::close(r2);
        }
    }
}
