// SPDX-License-Identifier: Apache-2.0

//! A reconnecting message client: dials a list of addresses in turn,
//! re-dials on failure or disconnect after a pause, and transparently caches
//! outgoing messages sent while no connection is up.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::thread::JoinHandle;

use crate::communicator::{Communicator, ConnectionRef};
use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::fd_connection::FdMode;
use crate::message::wire::Message;
use crate::stream::message_connection::MessageConnection;
use crate::stream::tcp::TcpClient;
use crate::thread_done::{drain_pipe, raw_pair, ThreadDoneSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Plain,
    Tls,
}

enum WorkerOutcome {
    Connected(RawFd, SocketAddr),
    Failed(String, usize),
}

/// A connection that keeps at most one live [`MessageConnection`] up,
/// redialing through `addresses` (round-robin, wrapping) whenever the link
/// drops, with a pause between attempts.
///
/// When `use_thread` is set, each attempt runs on a worker thread and the
/// object polls a worker-done pipe (`ConnectionKind::Reader`); otherwise it
/// connects inline from `process_timeout` and needs no descriptor at all
/// (`ConnectionKind::TimerOnly`). Either way, the live `MessageConnection`
/// is a second, independently reactor-registered connection: this object
/// learns the link dropped through that connection's `on_close` hook, not
/// through its own readiness events.
pub struct PermanentConnection {
    base: ConnectionBase,
    self_ref: Weak<RefCell<PermanentConnection>>,
    reactor: Weak<RefCell<Communicator>>,
    addresses: Vec<SocketAddr>,
    next_address: usize,
    #[allow(dead_code)]
    mode: StreamMode,
    pause_us: i64,
    use_thread: bool,
    connected: bool,
    thread_done_read_fd: RawFd,
    idle_signal: Option<ThreadDoneSignal>,
    worker: Option<JoinHandle<WorkerOutcome>>,
    messenger: Option<Rc<RefCell<MessageConnection>>>,
    messenger_conn: Option<ConnectionRef>,
    cache: VecDeque<Message>,
    on_connected: Option<Box<dyn FnMut(&mut PermanentConnection)>>,
    on_connection_failed: Option<Box<dyn FnMut(&mut PermanentConnection, &str)>>,
}

impl PermanentConnection {
    /// `pause_us` is the delay, in microseconds, between a failed or broken
    /// connection attempt and the next retry. TLS mode is accepted but not
    /// yet wired to an actual handshake; plain sockets are the only mode
    /// implemented today.
    pub fn new(
        name: impl Into<String>,
        reactor: &Rc<RefCell<Communicator>>,
        addresses: Vec<SocketAddr>,
        mode: StreamMode,
        pause_us: i64,
        use_thread: bool,
    ) -> Result<Rc<RefCell<Self>>> {
        if addresses.is_empty() {
            return Err(Error::init("permanent connection needs at least one address"));
        }
        let (thread_done_read_fd, idle_signal) = if use_thread {
            let (fd, signal) = raw_pair()?;
            (fd, Some(signal))
        } else {
            (-1, None)
        };
        let mut base = ConnectionBase::new(name);
        base.timeout_date_us = crate::clock::current_usec();
        let reactor_weak = Rc::downgrade(reactor);

        Ok(Rc::new_cyclic(|weak| {
            RefCell::new(PermanentConnection {
                base,
                self_ref: weak.clone(),
                reactor: reactor_weak,
                addresses,
                next_address: 0,
                mode,
                pause_us,
                use_thread,
                connected: false,
                thread_done_read_fd,
                idle_signal,
                worker: None,
                messenger: None,
                messenger_conn: None,
                cache: VecDeque::new(),
                on_connected: None,
                on_connection_failed: None,
            })
        }))
    }

    pub fn on_connected(&mut self, callback: impl FnMut(&mut PermanentConnection) + 'static) {
        self.on_connected = Some(Box::new(callback));
    }

    pub fn on_connection_failed(
        &mut self,
        callback: impl FnMut(&mut PermanentConnection, &str) + 'static,
    ) {
        self.on_connection_failed = Some(Box::new(callback));
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn messenger(&self) -> Option<Rc<RefCell<MessageConnection>>> {
        self.messenger.clone()
    }

    /// Sends `message` on the live connection, or, if `cache` is true and no
    /// connection is up, queues it for delivery in order once one is
    /// established. Returns whether the message was accepted (sent or
    /// queued); always false once the connection has been marked done.
    pub fn send_message(&mut self, message: &Message, cache: bool) -> bool {
        if self.is_done() {
            return false;
        }
        if self.connected {
            if let Some(messenger) = &self.messenger {
                return messenger.borrow_mut().send_message(message);
            }
        }
        if cache {
            self.cache.push_back(message.clone());
            true
        } else {
            false
        }
    }

    fn attempt_connect(&mut self) {
        if self.use_thread {
            self.start_worker();
        } else {
            self.attempt_connect_inline();
        }
    }

    fn attempt_connect_inline(&mut self) {
        match connect_round_robin(&self.addresses, self.next_address) {
            WorkerOutcome::Connected(fd, addr) => {
                self.next_address = next_index(&self.addresses, addr, self.next_address);
                self.install_messenger(fd, addr);
            }
            WorkerOutcome::Failed(reason, next_idx) => {
                self.next_address = next_idx;
                self.process_connection_failed(&reason);
            }
        }
    }

    fn start_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let Some(idle) = &self.idle_signal else {
            self.process_connection_failed("worker pipe is gone");
            return;
        };
        // A duplicate of the write end: the worker closes its copy after
        // signaling, but `self.idle_signal` keeps the pipe's read side from
        // ever seeing end-of-file between attempts.
        let signal = idle.clone();
        let addresses = self.addresses.clone();
        let start = self.next_address;
        let handle = std::thread::spawn(move || {
            let outcome = connect_round_robin(&addresses, start);
            signal.signal();
            outcome
        });
        self.worker = Some(handle);
    }

    fn install_messenger(&mut self, fd: RawFd, addr: SocketAddr) {
        log::info!(target: "eventdispatcher", "connected to {addr}");
        let messenger = match MessageConnection::new(
            format!("{}-messenger", self.base.name),
            fd,
            FdMode::ReadWrite,
        ) {
            Ok(m) => m,
            Err(e) => {
                self.process_connection_failed(&format!("could not wrap connected socket: {e}"));
                return;
            }
        };
        let typed = Rc::new(RefCell::new(messenger));
        let self_weak = self.self_ref.clone();
        typed.borrow_mut().on_close(move || {
            if let Some(strong) = self_weak.upgrade() {
                strong.borrow_mut().handle_link_lost();
            }
        });
        let erased: ConnectionRef = typed.clone();
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.borrow_mut().add_connection(erased.clone());
        }
        self.messenger = Some(typed.clone());
        self.messenger_conn = Some(erased);
        self.connected = true;
        let _ = self.set_timeout_delay(-1);

        while let Some(queued) = self.cache.pop_front() {
            typed.borrow_mut().send_message(&queued);
        }

        if let Some(mut callback) = self.on_connected.take() {
            callback(self);
            self.on_connected = Some(callback);
        }
    }

    /// Called from the live [`MessageConnection`]'s `on_close` hook once
    /// the reactor has already removed it.
    fn handle_link_lost(&mut self) {
        self.messenger = None;
        self.messenger_conn = None;
        if self.is_done() {
            return;
        }
        self.process_connection_failed("connection lost");
    }

    fn process_connection_failed(&mut self, reason: &str) {
        log::warn!(target: "eventdispatcher", "connection {:?} failed: {reason}", self.base.name);
        self.connected = false;
        let pause = jittered_pause(self.pause_us);
        let _ = self.set_timeout_delay(pause);
        if let Some(mut callback) = self.on_connection_failed.take() {
            callback(self, reason);
            self.on_connection_failed = Some(callback);
        }
    }
}

/// Uniform jitter over the top half of `base_us`, so simultaneously-failing
/// peers don't all redial on the same tick; never below the 10us timer
/// floor.
fn jittered_pause(base_us: i64) -> i64 {
    let base = base_us.max(10) as u64;
    let floor = (base / 2).max(10);
    if floor >= base {
        base as i64
    } else {
        fastrand::u64(floor..=base) as i64
    }
}

fn next_index(addresses: &[SocketAddr], connected_addr: SocketAddr, fallback: usize) -> usize {
    addresses
        .iter()
        .position(|a| *a == connected_addr)
        .map(|idx| (idx + 1) % addresses.len())
        .unwrap_or(fallback)
}

fn connect_round_robin(addresses: &[SocketAddr], start: usize) -> WorkerOutcome {
    let count = addresses.len();
    for step in 0..count {
        let idx = (start + step) % count;
        let addr = addresses[idx];
        match TcpClient::connect(addr) {
            Ok(fd) => return WorkerOutcome::Connected(fd, addr),
            Err(e) => {
                log::debug!(target: "eventdispatcher", "connect to {addr} failed: {e}");
            }
        }
    }
    WorkerOutcome::Failed("all addresses unreachable".into(), (start + 1) % count)
}

impl Connection for PermanentConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.thread_done_read_fd
    }

    fn kind(&self) -> ConnectionKind {
        if self.use_thread {
            ConnectionKind::Reader
        } else {
            ConnectionKind::TimerOnly
        }
    }

    fn mark_done(&mut self) {
        self.base_mut().done = true;
        self.base_mut().enabled = false;
        self.cache.clear();
    }

    fn process_timeout(&mut self) {
        if self.is_done() || self.connected {
            return;
        }
        self.attempt_connect();
    }

    fn process_read(&mut self) {
        drain_pipe(self.thread_done_read_fd);
        let Some(handle) = self.worker.take() else {
            return;
        };
        if !handle.is_finished() {
            self.worker = Some(handle);
            return;
        }
        match handle.join() {
            Ok(WorkerOutcome::Connected(fd, addr)) => {
                self.next_address = next_index(&self.addresses, addr, self.next_address);
                self.install_messenger(fd, addr);
            }
            Ok(WorkerOutcome::Failed(reason, next_idx)) => {
                self.next_address = next_idx;
                self.process_connection_failed(&reason);
            }
            Err(_) => self.process_connection_failed("worker thread panicked"),
        }
    }

    // The descriptor polled here is the worker-done pipe, never the message
    // link itself (that is a separately registered connection); a hangup or
    // error on it is routine bookkeeping, not cause to remove this object.
    fn process_error(&mut self) -> bool {
        false
    }

    fn process_hup(&mut self) -> bool {
        false
    }

    fn process_invalid(&mut self) -> bool {
        self.is_done()
    }
}

impl Drop for PermanentConnection {
    fn drop(&mut self) {
        if self.thread_done_read_fd >= 0 {
            unsafe { libc::close(self.thread_done_read_fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_address_list() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let result = PermanentConnection::new("p", &reactor, vec![], StreamMode::Plain, 50_000, false);
        assert!(result.is_err());
    }

    #[test]
    fn send_message_caches_while_disconnected() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let conn =
            PermanentConnection::new("p", &reactor, vec![addr], StreamMode::Plain, 50_000, false)
                .unwrap();
        let msg = Message::new("PING");
        assert!(conn.borrow_mut().send_message(&msg, true));
        assert_eq!(conn.borrow().cache.len(), 1);
        assert!(!conn.borrow_mut().send_message(&msg, false));
    }

    #[test]
    fn jittered_pause_stays_in_bounds() {
        for _ in 0..100 {
            let pause = jittered_pause(50_000);
            assert!(pause >= 25_000 && pause <= 50_000);
        }
        assert_eq!(jittered_pause(10), 10);
    }

    #[test]
    fn mark_done_clears_cache() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let conn =
            PermanentConnection::new("p", &reactor, vec![addr], StreamMode::Plain, 50_000, false)
                .unwrap();
        conn.borrow_mut().send_message(&Message::new("PING"), true);
        conn.borrow_mut().mark_done();
        assert!(conn.borrow().cache.is_empty());
        assert!(conn.borrow().is_done());
    }
}
