// SPDX-License-Identifier: Apache-2.0

//! Unix-domain stream listener and blocking client, mirroring
//! [`crate::stream::tcp`] but over `AF_UNIX` paths.

use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::set_nonblocking;

fn fill_sockaddr_un(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() >= 108 {
        return Err(Error::init("unix socket path is too long"));
    }
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = src as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((addr, len))
}

fn new_unix_socket() -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::from_errno("socket", nix::errno::Errno::last()));
    }
    Ok(fd)
}

pub struct UnixStreamListener {
    base: ConnectionBase,
    fd: RawFd,
    on_accept: Option<Box<dyn FnMut(&mut UnixStreamListener, RawFd)>>,
}

impl UnixStreamListener {
    pub fn bind(name: impl Into<String>, path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = new_unix_socket()?;
        let (addr, len) = fill_sockaddr_un(path).map_err(|e| {
            unsafe { libc::close(fd) };
            e
        })?;
        let rc = unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let e = Error::from_errno("bind", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let rc = unsafe { libc::listen(fd, 128) };
        if rc < 0 {
            let e = Error::from_errno("listen", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        set_nonblocking(fd)?;
        Ok(UnixStreamListener {
            base: ConnectionBase::new(name),
            fd,
            on_accept: None,
        })
    }

    pub fn on_accept(&mut self, callback: impl FnMut(&mut UnixStreamListener, RawFd) + 'static) {
        self.on_accept = Some(Box::new(callback));
    }
}

impl Connection for UnixStreamListener {
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
        ConnectionKind::Listener
    }

    fn process_accept(&mut self) {
        loop {
            let client_fd =
                unsafe { libc::accept4(self.fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) };
            if client_fd < 0 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                    break;
                }
                self.process_error();
                break;
            }
            if let Some(mut callback) = self.on_accept.take() {
                callback(self, client_fd);
                self.on_accept = Some(callback);
            } else {
                unsafe { libc::close(client_fd) };
            }
        }
    }
}

impl Drop for UnixStreamListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub struct UnixStreamClient;

impl UnixStreamClient {
    pub fn connect(path: &Path) -> Result<RawFd> {
        let fd = new_unix_socket()?;
        let (addr, len) = fill_sockaddr_un(path)?;
        let rc = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let e = Error::from_errno("connect", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_path() {
        let long = "x".repeat(200);
        assert!(UnixStreamListener::bind("l", Path::new(&long)).is_err());
    }
}
