// SPDX-License-Identifier: Apache-2.0

//! A plain (non-reactor) UDP client: connects so `send`/`recv` can be used
//! without re-specifying the peer address on every call.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

pub struct UdpClient {
    fd: RawFd,
}

impl UdpClient {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::from_errno("socket", nix::errno::Errno::last()));
        }
        let (storage, len) = crate::stream::tcp::fill_sockaddr(addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let e = Error::from_errno("connect", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(UdpClient { fd })
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(Error::from_errno("send", nix::errno::Errno::last()));
        }
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(Error::from_errno("recv", nix::errno::Errno::last()));
        }
        Ok(n as usize)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
