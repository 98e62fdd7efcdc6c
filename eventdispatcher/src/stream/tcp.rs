// SPDX-License-Identifier: Apache-2.0

//! TCP listener and blocking client. The listener is reactor-driven; the
//! client is a specialty, blocking-connect helper that must never be
//! registered with the reactor (non-blocking clients are built by
//! connecting a plain socket and wrapping it in a
//! [`BufferedFdConnection`](crate::buffered_fd_connection::BufferedFdConnection)).
//!
//! Socket setup goes through raw `libc` calls directly rather than a
//! higher-level sockets crate, the same way the rest of this crate talks
//! to `poll`/`read`/`writev` directly.

use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::set_nonblocking;

pub(crate) fn fill_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn parse_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin: libc::sockaddr_in =
                unsafe { std::ptr::read(storage as *const _ as *const libc::sockaddr_in) };
            let ip = IpAddr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = IpAddr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip, u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

fn new_stream_socket(addr: SocketAddr) -> Result<RawFd> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::from_errno("socket", nix::errno::Errno::last()));
    }
    Ok(fd)
}

/// A reactor-driven TCP listener: accepts connections non-blockingly and
/// hands each accepted descriptor, along with the peer address, to a
/// callback — the callback is responsible for wrapping the descriptor in
/// a connection type and registering it with the reactor.
pub struct TcpListener {
    base: ConnectionBase,
    fd: RawFd,
    on_accept: Option<Box<dyn FnMut(&mut TcpListener, RawFd, SocketAddr)>>,
}

impl TcpListener {
    pub fn bind(name: impl Into<String>, addr: SocketAddr) -> Result<Self> {
        let fd = new_stream_socket(addr)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (storage, len) = fill_sockaddr(addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
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
        Ok(TcpListener {
            base: ConnectionBase::new(name),
            fd,
            on_accept: None,
        })
    }

    /// Returns the bound local address (useful for `bind`ing port `0`).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(Error::from_errno("getsockname", nix::errno::Errno::last()));
        }
        parse_sockaddr(&storage).ok_or_else(|| Error::logic("listener socket is not INET/INET6"))
    }

    pub fn on_accept(
        &mut self,
        callback: impl FnMut(&mut TcpListener, RawFd, SocketAddr) + 'static,
    ) {
        self.on_accept = Some(Box::new(callback));
    }
}

impl Connection for TcpListener {
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
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let client_fd = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_CLOEXEC,
                )
            };
            if client_fd < 0 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                    break;
                }
                self.process_error();
                break;
            }
            let Some(peer_addr) = parse_sockaddr(&storage) else {
                unsafe { libc::close(client_fd) };
                continue;
            };
            if let Some(mut callback) = self.on_accept.take() {
                callback(self, client_fd, peer_addr);
                self.on_accept = Some(callback);
            } else {
                unsafe { libc::close(client_fd) };
            }
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Blocking TCP client connect helper for specialty, non-reactor uses. The
/// returned descriptor is left in blocking mode; wrap it in a
/// [`BufferedFdConnection`](crate::buffered_fd_connection::BufferedFdConnection)
/// (which marks it non-blocking) before registering it with a reactor.
pub struct TcpClient;

impl TcpClient {
    pub fn connect(addr: SocketAddr) -> Result<RawFd> {
        let fd = new_stream_socket(addr)?;
        let (storage, len) = fill_sockaddr(addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let e = Error::from_errno("connect", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(fd)
    }

    /// Starts a non-blocking connect; returns the descriptor immediately.
    /// The caller polls it for write-readiness and then checks `SO_ERROR`
    /// to learn whether the connection actually succeeded.
    pub fn connect_nonblocking(addr: SocketAddr) -> Result<RawFd> {
        let fd = new_stream_socket(addr)?;
        set_nonblocking(fd)?;
        let (storage, len) = fill_sockaddr(addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let errno = nix::errno::Errno::last();
            if errno != nix::errno::Errno::EINPROGRESS {
                unsafe { libc::close(fd) };
                return Err(Error::from_errno("connect", errno));
            }
        }
        Ok(fd)
    }
}
