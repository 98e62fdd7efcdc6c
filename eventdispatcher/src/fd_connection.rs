// SPDX-License-Identifier: Apache-2.0

//! Concrete readiness source wrapping a raw, already-open file descriptor,
//! minus the line-framing and output queue that
//! [`crate::buffered_fd_connection::BufferedFdConnection`] adds on top.

use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

pub struct FdConnection {
    base: ConnectionBase,
    fd: RawFd,
    mode: FdMode,
    is_listener: bool,
}

impl FdConnection {
    /// Wraps `fd`, marking it non-blocking on construction.
    pub fn new(name: impl Into<String>, fd: RawFd, mode: FdMode) -> Result<Self> {
        if fd < 0 {
            return Err(Error::init("cannot wrap a negative file descriptor"));
        }
        set_nonblocking(fd)?;
        Ok(FdConnection {
            base: ConnectionBase::new(name),
            fd,
            mode,
            is_listener: false,
        })
    }

    pub fn set_as_listener(&mut self, is_listener: bool) {
        self.is_listener = is_listener;
    }

    pub fn mode(&self) -> FdMode {
        self.mode
    }

    pub fn can_read(&self) -> bool {
        matches!(self.mode, FdMode::ReadOnly | FdMode::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self.mode, FdMode::WriteOnly | FdMode::ReadWrite)
    }
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::from_errno("fcntl(F_GETFL)", e))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::from_errno("fcntl(F_SETFL)", e))?;
    Ok(())
}

impl Connection for FdConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn kind(&self) -> ConnectionKind {
        if self.is_listener {
            ConnectionKind::Listener
        } else {
            match self.mode {
                FdMode::ReadOnly => ConnectionKind::Reader,
                FdMode::WriteOnly => ConnectionKind::Writer,
                FdMode::ReadWrite => ConnectionKind::ReaderWriter,
            }
        }
    }
}

impl Drop for FdConnection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = nix::unistd::close(self.fd);
        }
    }
}
