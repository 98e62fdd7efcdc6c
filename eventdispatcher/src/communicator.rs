// SPDX-License-Identifier: Apache-2.0

//! The reactor ("communicator"): a priority-ordered, poll-driven dispatch
//! loop that owns a set of connections and invokes their readiness/timeout
//! callbacks.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use libc::{
    nfds_t, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, POLLRDHUP,
};

use crate::connection::{Connection, ConnectionKind};
use crate::error::{Error, Result};

pub type ConnectionRef = Rc<RefCell<dyn Connection>>;

fn requested_events(kind: ConnectionKind) -> i16 {
    match kind {
        ConnectionKind::Listener | ConnectionKind::Signal => POLLIN,
        ConnectionKind::Reader => POLLIN | POLLPRI | POLLRDHUP,
        ConnectionKind::Writer => POLLOUT | POLLRDHUP,
        ConnectionKind::ReaderWriter => POLLIN | POLLPRI | POLLOUT | POLLRDHUP,
        ConnectionKind::TimerOnly => 0,
    }
}

/// Owner of the connection set; runs the dispatch loop.
pub struct Communicator {
    connections: Vec<ConnectionRef>,
    force_sort: bool,
    running: bool,
    pub log_connections_on_remove: bool,
    pub log_connections_before_poll: bool,
}

impl Default for Communicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator {
    pub fn new() -> Self {
        Communicator {
            connections: Vec::new(),
            force_sort: false,
            running: false,
            log_connections_on_remove: false,
            log_connections_before_poll: false,
        }
    }

    /// Rejects a connection without a valid descriptor (unless it is
    /// timer-only, which never has one); idempotent, a second add of the
    /// same connection is a no-op returning `false`.
    ///
    /// Panics if the connection manages its own reactor registration (see
    /// [`Connection::self_managed`]) — those connections add/remove
    /// themselves as their listener count transitions to/from zero, and a
    /// caller reaching in directly would desynchronize that bookkeeping.
    pub fn add_connection(&mut self, connection: ConnectionRef) -> bool {
        assert!(
            !connection.borrow().self_managed(),
            "connection {:?} manages its own reactor registration; do not add it directly",
            connection.borrow().name()
        );
        self.add_connection_inner(connection)
    }

    pub fn remove_connection(&mut self, connection: &ConnectionRef) -> bool {
        assert!(
            !connection.borrow().self_managed(),
            "connection {:?} manages its own reactor registration; do not remove it directly",
            connection.borrow().name()
        );
        self.remove_connection_inner(connection)
    }

    /// Bypasses the `self_managed` guard; only for a connection's own
    /// register/unregister hooks to call on themselves.
    pub(crate) fn add_connection_inner(&mut self, connection: ConnectionRef) -> bool {
        {
            let c = connection.borrow();
            if !c.valid_socket() {
                log::warn!(target: "eventdispatcher", "refusing to add connection {:?}: invalid descriptor", c.name());
                return false;
            }
        }
        if self
            .connections
            .iter()
            .any(|existing| Rc::ptr_eq(existing, &connection))
        {
            return false;
        }
        log::debug!(target: "eventdispatcher", "adding connection {:?}", connection.borrow().name());
        self.connections.push(connection);
        self.force_sort = true;
        true
    }

    pub(crate) fn remove_connection_inner(&mut self, connection: &ConnectionRef) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| !Rc::ptr_eq(c, connection));
        let removed = self.connections.len() != before;
        if removed && self.log_connections_on_remove {
            log::debug!(
                target: "eventdispatcher",
                "removed connection {:?}, {} connection(s) remain",
                connection.borrow().name(),
                self.connections.len()
            );
        }
        removed
    }

    pub fn get_connections(&self) -> &[ConnectionRef] {
        &self.connections
    }

    pub fn set_force_sort(&mut self) {
        self.force_sort = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn sort_if_dirty(&mut self) {
        if !self.force_sort {
            return;
        }
        self.connections
            .sort_by_key(|c| c.borrow().priority());
        self.force_sort = false;
    }

    /// Runs the loop until the connection set becomes empty, or an
    /// unrecoverable error is raised.
    pub fn run(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Recursive("communicator::run() is already running".into()));
        }
        self.running = true;
        let result = (|| {
            while !self.connections.is_empty() {
                self.run_once()?;
            }
            Ok(())
        })();
        self.running = false;
        result
    }

    /// Runs exactly one iteration of the dispatch loop. Public so tests
    /// and embedders can single-step the reactor.
    pub fn run_once(&mut self) -> Result<()> {
        if self.connections.is_empty() {
            return Ok(());
        }

        self.sort_if_dirty();

        // Step 3: snapshot the connection vector.
        let snapshot: Vec<ConnectionRef> = self.connections.clone();

        // Step 4: freeze the authoritative "enabled" flag and saved timeout
        // for this iteration.
        let mut authorized_enabled = Vec::with_capacity(snapshot.len());
        for conn in &snapshot {
            let mut c = conn.borrow_mut();
            let enabled = c.is_enabled();
            authorized_enabled.push(enabled);
            if enabled {
                c.save_timeout_timestamp();
            }
        }

        if self.log_connections_before_poll {
            for (conn, enabled) in snapshot.iter().zip(&authorized_enabled) {
                if *enabled {
                    log::trace!(target: "eventdispatcher", "about to poll connection {:?}", conn.borrow().name());
                }
            }
        }

        // Step 5: build the poll vector.
        let mut poll_fds: Vec<pollfd> = Vec::new();
        let mut slot_for_index: Vec<Option<usize>> = vec![None; snapshot.len()];
        for (idx, conn) in snapshot.iter().enumerate() {
            if !authorized_enabled[idx] {
                continue;
            }
            let c = conn.borrow();
            if !c.valid_socket() {
                continue;
            }
            let kind = c.kind();
            if kind == ConnectionKind::TimerOnly {
                continue;
            }
            let fd: RawFd = c.raw_fd();
            if fd < 0 {
                continue;
            }
            slot_for_index[idx] = Some(poll_fds.len());
            poll_fds.push(pollfd {
                fd,
                events: requested_events(kind),
                revents: 0,
            });
        }

        // Step 6: compute the poll timeout.
        let now = crate::clock::current_usec();
        let mut min_timeout: Option<i64> = None;
        for (idx, conn) in snapshot.iter().enumerate() {
            if !authorized_enabled[idx] {
                continue;
            }
            let ts = conn.borrow().saved_timeout_timestamp();
            if ts == -1 {
                continue;
            }
            min_timeout = Some(match min_timeout {
                Some(current) => current.min(ts),
                None => ts,
            });
        }

        if poll_fds.is_empty() && min_timeout.is_none() {
            return Err(Error::runtime("no pollable connection and no timer armed"));
        }

        let timeout_ms: i32 = match min_timeout {
            None => -1,
            Some(ts) => {
                let remaining_us = ts - now;
                if remaining_us <= 0 {
                    0
                } else {
                    let ms = remaining_us / 1000;
                    if ms == 0 {
                        1
                    } else {
                        ms.min(i32::MAX as i64) as i32
                    }
                }
            }
        };

        // Step 7: poll.
        let poll_result = if poll_fds.is_empty() {
            // Nothing to poll, but a timer is armed: sleep out the timeout.
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.max(0) as u64));
            0
        } else {
            unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) }
        };

        if poll_result < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINTR {
                return Err(Error::from_errno("poll", errno));
            }
            return Err(Error::from_errno("poll", errno));
        }

        // Step 7 continued: dispatch readiness, then timeouts, in snapshot
        // priority order.
        let mut to_remove: Vec<ConnectionRef> = Vec::new();

        for (idx, conn) in snapshot.iter().enumerate() {
            if !authorized_enabled[idx] {
                continue;
            }

            if let Some(slot) = slot_for_index[idx] {
                let revents = poll_fds[slot].revents;
                if revents != 0 {
                    let kind = conn.borrow().kind();
                    let mut removed = false;

                    if revents & POLLIN != 0 && kind == ConnectionKind::Signal {
                        conn.borrow_mut().process_signal();
                    } else if revents & POLLIN != 0 && kind == ConnectionKind::Listener {
                        conn.borrow_mut().process_accept();
                    } else if revents & (POLLIN | POLLPRI) != 0 {
                        conn.borrow_mut().process_read();
                    }

                    // Every matching bit's handler runs unconditionally: a
                    // reset socket commonly raises POLLERR and POLLHUP
                    // together, and each has its own close/callback duty.
                    if revents & POLLOUT != 0 {
                        removed |= conn.borrow_mut().process_write();
                    }

                    if revents & POLLERR != 0 {
                        removed |= conn.borrow_mut().process_error();
                    }

                    if revents & (POLLHUP | POLLRDHUP) != 0 {
                        removed |= conn.borrow_mut().process_hup();
                    }

                    if revents & POLLNVAL != 0 {
                        removed |= conn.borrow_mut().process_invalid();
                    }

                    if !removed && conn.borrow().is_done() {
                        removed = true;
                    }

                    if removed {
                        to_remove.push(Rc::clone(conn));
                    }
                }
            }

            if to_remove.iter().any(|r| Rc::ptr_eq(r, conn)) {
                continue;
            }

            let saved_ts = conn.borrow().saved_timeout_timestamp();
            if saved_ts != -1 && saved_ts <= now {
                let mut c = conn.borrow_mut();
                c.calculate_next_tick();
                c.process_timeout();
                drop(c);
                if conn.borrow().is_done() {
                    to_remove.push(Rc::clone(conn));
                }
            }
        }

        for conn in to_remove {
            self.remove_connection_inner(&conn);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBase;
    use std::cell::Cell;
    use std::rc::Rc;

    struct RecordingTimer {
        base: ConnectionBase,
        fired: Rc<Cell<u32>>,
    }

    impl Connection for RecordingTimer {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut ConnectionBase {
            &mut self.base
        }
        fn process_timeout(&mut self) {
            self.fired.set(self.fired.get() + 1);
            self.mark_done();
        }
    }

    #[test]
    fn add_connection_is_idempotent() {
        let mut reactor = Communicator::new();
        let fired = Rc::new(Cell::new(0));
        let mut base = ConnectionBase::new("t");
        base.timeout_delay_us = -1;
        base.timeout_date_us = crate::clock::current_usec();
        let conn: ConnectionRef = Rc::new(RefCell::new(RecordingTimer { base, fired }));
        assert!(reactor.add_connection(conn.clone()));
        assert!(!reactor.add_connection(conn.clone()));
        assert_eq!(reactor.get_connections().len(), 1);
    }

    #[test]
    fn remove_connection_twice_returns_false() {
        let mut reactor = Communicator::new();
        let fired = Rc::new(Cell::new(0));
        let base = ConnectionBase::new("t");
        let conn: ConnectionRef = Rc::new(RefCell::new(RecordingTimer { base, fired }));
        reactor.add_connection(conn.clone());
        assert!(reactor.remove_connection(&conn));
        assert!(!reactor.remove_connection(&conn));
    }

    #[test]
    fn one_shot_timer_fires_and_self_removes() {
        let mut reactor = Communicator::new();
        let fired = Rc::new(Cell::new(0));
        let mut base = ConnectionBase::new("t");
        base.timeout_date_us = crate::clock::current_usec();
        let conn: ConnectionRef = Rc::new(RefCell::new(RecordingTimer { base, fired: fired.clone() }));
        reactor.add_connection(conn);
        reactor.run().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(reactor.get_connections().is_empty());
    }

    #[test]
    fn recursive_run_rejected() {
        // A connection whose process_timeout calls run() again.
        struct Reentrant {
            base: ConnectionBase,
        }
        impl Connection for Reentrant {
            fn base(&self) -> &ConnectionBase {
                &self.base
            }
            fn base_mut(&mut self) -> &mut ConnectionBase {
                &mut self.base
            }
        }
        let mut base = ConnectionBase::new("r");
        base.timeout_date_us = crate::clock::current_usec();
        let conn: ConnectionRef = Rc::new(RefCell::new(Reentrant { base }));
        let mut reactor = Communicator::new();
        reactor.add_connection(conn);
        reactor.running = true;
        assert!(matches!(reactor.run(), Err(Error::Recursive(_))));
        reactor.running = false;
    }
}
