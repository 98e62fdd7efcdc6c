// SPDX-License-Identifier: Apache-2.0

//! A `NETLINK_SOCK_DIAG` watcher: polls the kernel's socket table for IPv4
//! listeners matching a set of registered `(address, port)` pairs, calling
//! back once each one enters `LISTEN`.
//!
//! The kernel headers for `inet_diag` aren't exposed by `libc`, so the
//! wire structures are reproduced here with `#[repr(C)]`, matching
//! `<linux/inet_diag.h>`.

use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::set_nonblocking;

const NETLINK_SOCK_DIAG: libc::c_int = 4;
const SOCK_DIAG_BY_FAMILY: u16 = 20;
const TCP_LISTEN: u8 = 10;
const NLM_F_REQUEST: u16 = 1;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

/// Minimum gap between repeat queries for a registration that hasn't
/// started listening yet, so a busy poll loop doesn't flood the kernel
/// with identical requests every iteration.
const QUERY_INTERVAL_US: i64 = 200_000;

#[repr(C)]
#[derive(Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InetDiagSockId {
    sport: u16,
    dport: u16,
    src: [u32; 4],
    dst: [u32; 4],
    interface: u32,
    cookie: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InetDiagReqV2 {
    sdiag_family: u8,
    sdiag_protocol: u8,
    idiag_ext: u8,
    pad: u8,
    idiag_states: u32,
    id: InetDiagSockId,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InetDiagMsg {
    idiag_family: u8,
    idiag_state: u8,
    idiag_timer: u8,
    idiag_retrans: u8,
    id: InetDiagSockId,
    idiag_expires: u32,
    idiag_rqueue: u32,
    idiag_wqueue: u32,
    idiag_uid: u32,
    idiag_inode: u32,
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

struct Registration {
    addr: Ipv4Addr,
    port: u16,
    listening: bool,
    last_query_us: i64,
    callback: Box<dyn FnMut(Ipv4Addr, u16)>,
}

/// A registration handle returned by [`SocketEventsWatcher::register`],
/// used to [`lost_connection`](SocketEventsWatcher::lost_connection) or
/// [`unregister`](SocketEventsWatcher::unregister) it later.
pub type RegistrationToken = usize;

pub struct SocketEventsWatcher {
    base: ConnectionBase,
    fd: RawFd,
    seq: u32,
    registrations: Vec<Registration>,
}

impl SocketEventsWatcher {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_SOCK_DIAG,
            )
        };
        if fd < 0 {
            return Err(Error::from_errno("socket(AF_NETLINK)", nix::errno::Errno::last()));
        }
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Error::from_errno("bind(AF_NETLINK)", nix::errno::Errno::last());
            unsafe { libc::close(fd) };
            return Err(e);
        }
        set_nonblocking(fd)?;
        Ok(SocketEventsWatcher {
            base: ConnectionBase::new(name),
            fd,
            seq: 0,
            registrations: Vec::new(),
        })
    }

    /// Watches `addr:port`, invoking `callback(addr, port)` exactly once,
    /// the first time it is observed in `LISTEN`.
    pub fn register(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        callback: impl FnMut(Ipv4Addr, u16) + 'static,
    ) -> RegistrationToken {
        self.registrations.push(Registration {
            addr,
            port,
            listening: false,
            last_query_us: -1,
            callback: Box::new(callback),
        });
        self.registrations.len() - 1
    }

    pub fn unregister(&mut self, token: RegistrationToken) {
        if token < self.registrations.len() {
            self.registrations.remove(token);
        }
    }

    /// Marks a registration as no longer listening, so it is queried again
    /// on the next writable-readiness pass.
    pub fn lost_connection(&mut self, token: RegistrationToken) {
        if let Some(reg) = self.registrations.get_mut(token) {
            reg.listening = false;
            reg.last_query_us = -1;
        }
    }

    fn send_query(&mut self, addr: Ipv4Addr, port: u16) {
        self.seq = self.seq.wrapping_add(1);
        let req = InetDiagReqV2 {
            sdiag_family: libc::AF_INET as u8,
            sdiag_protocol: libc::IPPROTO_TCP as u8,
            idiag_ext: 0,
            pad: 0,
            idiag_states: 1u32 << TCP_LISTEN,
            id: InetDiagSockId {
                sport: port.to_be(),
                dport: 0,
                src: [u32::from_ne_bytes(addr.octets()), 0, 0, 0],
                dst: [0; 4],
                interface: 0,
                cookie: [u32::MAX, u32::MAX],
            },
        };
        let total_len = mem::size_of::<NlMsgHdr>() + mem::size_of::<InetDiagReqV2>();
        let hdr = NlMsgHdr {
            nlmsg_len: total_len as u32,
            nlmsg_type: SOCK_DIAG_BY_FAMILY,
            nlmsg_flags: NLM_F_REQUEST,
            nlmsg_seq: self.seq,
            nlmsg_pid: 0,
        };
        let mut buf = Vec::with_capacity(total_len);
        unsafe {
            buf.extend_from_slice(std::slice::from_raw_parts(
                &hdr as *const _ as *const u8,
                mem::size_of::<NlMsgHdr>(),
            ));
            buf.extend_from_slice(std::slice::from_raw_parts(
                &req as *const _ as *const u8,
                mem::size_of::<InetDiagReqV2>(),
            ));
        }
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n < 0 {
            log::debug!(target: "eventdispatcher", "socket-events query for {addr}:{port} failed: {}", nix::errno::Errno::last());
        }
    }

    fn handle_reply(&mut self, msg: &InetDiagMsg) {
        if msg.idiag_state != TCP_LISTEN {
            return;
        }
        let reply_addr = Ipv4Addr::from(msg.id.src[0].to_ne_bytes());
        let reply_port = u16::from_be(msg.id.sport);
        for reg in self.registrations.iter_mut() {
            if !reg.listening && reg.addr == reply_addr && reg.port == reply_port {
                reg.listening = true;
                (reg.callback)(reg.addr, reg.port);
            }
        }
    }

    fn drain_replies(&mut self) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let errno = nix::errno::Errno::last();
                if errno != nix::errno::Errno::EAGAIN && errno != nix::errno::Errno::EWOULDBLOCK {
                    log::warn!(target: "eventdispatcher", "socket-events recv failed: {errno}");
                }
                break;
            }
            if n == 0 {
                break;
            }
            let mut offset = 0usize;
            let n = n as usize;
            while offset + mem::size_of::<NlMsgHdr>() <= n {
                let hdr: NlMsgHdr = unsafe {
                    std::ptr::read_unaligned(buf[offset..].as_ptr() as *const NlMsgHdr)
                };
                let msg_len = hdr.nlmsg_len as usize;
                if msg_len < mem::size_of::<NlMsgHdr>() || offset + msg_len > n {
                    break;
                }
                if hdr.nlmsg_type == NLMSG_DONE || hdr.nlmsg_type == NLMSG_ERROR {
                    offset += nlmsg_align(msg_len);
                    continue;
                }
                let payload_off = offset + mem::size_of::<NlMsgHdr>();
                if payload_off + mem::size_of::<InetDiagMsg>() <= offset + msg_len {
                    let msg: InetDiagMsg = unsafe {
                        std::ptr::read_unaligned(buf[payload_off..].as_ptr() as *const InetDiagMsg)
                    };
                    self.handle_reply(&msg);
                }
                offset += nlmsg_align(msg_len);
            }
        }
    }
}

impl Connection for SocketEventsWatcher {
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
        ConnectionKind::ReaderWriter
    }

    fn process_read(&mut self) {
        self.drain_replies();
    }

    fn process_write(&mut self) -> bool {
        let now = crate::clock::current_usec();
        let due: Vec<(Ipv4Addr, u16)> = self
            .registrations
            .iter()
            .filter(|r| !r.listening && now - r.last_query_us >= QUERY_INTERVAL_US)
            .map(|r| (r.addr, r.port))
            .collect();
        for (addr, port) in due {
            self.send_query(addr, port);
            if let Some(reg) = self
                .registrations
                .iter_mut()
                .find(|r| r.addr == addr && r.port == port)
            {
                reg.last_query_us = now;
            }
        }
        false
    }
}

impl Drop for SocketEventsWatcher {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_increasing_tokens() {
        let mut watcher = SocketEventsWatcher::new("watcher").unwrap();
        let a = watcher.register("127.0.0.1".parse().unwrap(), 8080, |_, _| {});
        let b = watcher.register("127.0.0.1".parse().unwrap(), 9090, |_, _| {});
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn lost_connection_rearms_registration() {
        let mut watcher = SocketEventsWatcher::new("watcher").unwrap();
        let token = watcher.register("127.0.0.1".parse().unwrap(), 8080, |_, _| {});
        watcher.registrations[token].listening = true;
        watcher.lost_connection(token);
        assert!(!watcher.registrations[token].listening);
    }

    #[test]
    fn nlmsg_align_rounds_up_to_four() {
        assert_eq!(nlmsg_align(17), 20);
        assert_eq!(nlmsg_align(16), 16);
    }
}
