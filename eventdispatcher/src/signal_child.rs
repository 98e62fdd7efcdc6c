// SPDX-License-Identifier: Apache-2.0

//! SIGCHLD reaper: one signal descriptor shared by every interested child
//! listener, draining `waitid(WNOWAIT)` status reports and routing them by
//! PID.
//!
//! Registration is guarded by a mutex (not `RefCell`) because worker
//! threads, not just the reactor thread, may register interest in a child
//! they just spawned.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus};

use crate::communicator::{Communicator, ConnectionRef};
use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};
use crate::signal::SignalConnection;

pub const RUNNING: u8 = 0b0_0001;
pub const EXITED: u8 = 0b0_0010;
pub const SIGNALED: u8 = 0b0_0100;
pub const STOPPED: u8 = 0b0_1000;
pub const CONTINUED: u8 = 0b1_0000;

#[derive(Debug, Clone, Copy)]
pub struct ChildStatus {
    pub pid: i32,
    pub mask: u8,
    pub exit_code: Option<i32>,
    pub terminate_signal: Option<i32>,
}

impl ChildStatus {
    fn from_wait_status(status: &WaitStatus) -> Option<Self> {
        match *status {
            WaitStatus::Exited(pid, code) => Some(ChildStatus {
                pid: pid.as_raw(),
                mask: EXITED,
                exit_code: Some(code),
                terminate_signal: None,
            }),
            WaitStatus::Signaled(pid, sig, _core) => Some(ChildStatus {
                pid: pid.as_raw(),
                mask: SIGNALED,
                exit_code: None,
                terminate_signal: Some(sig as i32),
            }),
            WaitStatus::Stopped(pid, sig) => Some(ChildStatus {
                pid: pid.as_raw(),
                mask: STOPPED,
                exit_code: None,
                terminate_signal: Some(sig as i32),
            }),
            WaitStatus::Continued(pid) => Some(ChildStatus {
                pid: pid.as_raw(),
                mask: CONTINUED,
                exit_code: None,
                terminate_signal: None,
            }),
            WaitStatus::StillAlive => None,
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.mask & (EXITED | SIGNALED) != 0
    }
}

struct Listener {
    pid: i32,
    mask: u8,
    callback: Box<dyn FnMut(ChildStatus) + Send>,
}

/// A reactor connection owning the process's SIGCHLD signalfd plus a
/// mutex-guarded list of `(pid, callback, mask)` registrations. Listeners
/// may only be added/removed through [`SignalChildReaper::add_listener`]/
/// [`remove_listener`](SignalChildReaper::remove_listener); there is no
/// direct path to the underlying signal connection.
///
/// The reaper registers itself with the reactor the moment the listener
/// list goes from empty to non-empty, and removes itself the moment it
/// goes back to empty — callers never call `Communicator::add_connection`/
/// `remove_connection` on it directly (doing so panics; see
/// [`Connection::self_managed`]).
pub struct SignalChildReaper {
    base: ConnectionBase,
    signal: SignalConnection,
    listeners: Mutex<Vec<Listener>>,
    self_ref: Weak<RefCell<SignalChildReaper>>,
    reactor: Weak<RefCell<Communicator>>,
}

impl SignalChildReaper {
    pub fn new(name: impl Into<String>, reactor: &Rc<RefCell<Communicator>>) -> Result<Rc<RefCell<Self>>> {
        let signal = SignalConnection::new("sigchld", Signal::SIGCHLD)?;
        let base = ConnectionBase::new(name);
        let reactor_weak = Rc::downgrade(reactor);
        Ok(Rc::new_cyclic(|weak| {
            RefCell::new(SignalChildReaper {
                base,
                signal,
                listeners: Mutex::new(Vec::new()),
                self_ref: weak.clone(),
                reactor: reactor_weak,
            })
        }))
    }

    pub fn add_listener(
        &self,
        pid: i32,
        mask: u8,
        callback: impl FnMut(ChildStatus) + Send + 'static,
    ) -> Result<()> {
        if pid <= 0 {
            return Err(Error::init("child listener pid must be > 0"));
        }
        if mask == 0 {
            return Err(Error::init("child listener mask must be non-zero"));
        }
        let was_empty = {
            let mut listeners = self.listeners.lock().unwrap();
            let was_empty = listeners.is_empty();
            listeners.push(Listener {
                pid,
                mask,
                callback: Box::new(callback),
            });
            was_empty
        };
        if was_empty {
            self.register_with_reactor();
        }
        Ok(())
    }

    pub fn remove_listener(&self, pid: i32) -> bool {
        let (removed, now_empty) = {
            let mut listeners = self.listeners.lock().unwrap();
            let before = listeners.len();
            listeners.retain(|l| l.pid != pid);
            let removed = listeners.len() != before;
            (removed, listeners.is_empty())
        };
        if removed && now_empty {
            self.unregister_from_reactor();
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Upgrades both back-references and adds this reaper to the reactor
    /// through the crate-private bypass, sidestepping the `self_managed`
    /// guard on the public `add_connection`.
    fn register_with_reactor(&self) {
        let (Some(reactor), Some(me)) = (self.reactor.upgrade(), self.self_ref.upgrade()) else {
            return;
        };
        let erased: ConnectionRef = me;
        reactor.borrow_mut().add_connection_inner(erased);
    }

    fn unregister_from_reactor(&self) {
        let (Some(reactor), Some(me)) = (self.reactor.upgrade(), self.self_ref.upgrade()) else {
            return;
        };
        let erased: ConnectionRef = me;
        reactor.borrow_mut().remove_connection_inner(&erased);
    }

    /// Drains every available status with `WNOWAIT` (leaving terminal
    /// zombies reapable) and notifies matching listeners; terminal
    /// statuses are then reaped for real with a final blocking `waitid`
    /// and the listener is dropped. Removing the last listener here
    /// triggers the same auto-unregister as an explicit `remove_listener`.
    fn reap_available(&self) {
        loop {
            let status = nix::sys::wait::waitid(
                Id::All,
                WaitPidFlag::WNOWAIT
                    | WaitPidFlag::WEXITED
                    | WaitPidFlag::WSTOPPED
                    | WaitPidFlag::WCONTINUED
                    | WaitPidFlag::WNOHANG,
            );
            let status = match status {
                Ok(s) => s,
                Err(_) => break,
            };
            let Some(child) = ChildStatus::from_wait_status(&status) else {
                break;
            };

            let mut now_empty = false;
            let mut listeners = self.listeners.lock().unwrap();
            for listener in listeners.iter_mut() {
                if listener.pid == child.pid && listener.mask & child.mask != 0 {
                    (listener.callback)(child);
                }
            }
            if child.is_terminal() {
                listeners.retain(|l| l.pid != child.pid);
                now_empty = listeners.is_empty();
            }
            drop(listeners);

            if child.is_terminal() {
                let _ = nix::sys::wait::waitid(
                    Id::Pid(nix::unistd::Pid::from_raw(child.pid)),
                    WaitPidFlag::WEXITED,
                );
            }
            if now_empty {
                self.unregister_from_reactor();
            }
        }
    }
}

impl Connection for SignalChildReaper {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.signal.raw_fd()
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Signal
    }

    fn self_managed(&self) -> bool {
        true
    }

    fn process_signal(&mut self) {
        self.signal.process_signal();
        self.reap_available();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_registration_validates_pid_and_mask() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let reaper = SignalChildReaper::new("r", &reactor).unwrap();
        let reaper = reaper.borrow();
        assert!(reaper.add_listener(0, EXITED, |_| {}).is_err());
        assert!(reaper.add_listener(1, 0, |_| {}).is_err());
        assert!(reaper.add_listener(1, EXITED, |_| {}).is_ok());
        assert_eq!(reaper.listener_count(), 1);
    }

    #[test]
    fn remove_listener_returns_false_when_absent() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let reaper = SignalChildReaper::new("r", &reactor).unwrap();
        assert!(!reaper.borrow().remove_listener(123));
    }

    #[test]
    fn first_listener_auto_registers_last_removal_auto_unregisters() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let reaper = SignalChildReaper::new("r", &reactor).unwrap();
        assert_eq!(reactor.borrow().get_connections().len(), 0);

        reaper.borrow().add_listener(1, EXITED, |_| {}).unwrap();
        assert_eq!(reactor.borrow().get_connections().len(), 1);

        reaper.borrow().add_listener(2, EXITED, |_| {}).unwrap();
        assert_eq!(
            reactor.borrow().get_connections().len(),
            1,
            "a second listener must not add a second reactor entry"
        );

        assert!(reaper.borrow().remove_listener(1));
        assert_eq!(reactor.borrow().get_connections().len(), 1);

        assert!(reaper.borrow().remove_listener(2));
        assert_eq!(reactor.borrow().get_connections().len(), 0);
    }

    #[test]
    #[should_panic(expected = "manages its own reactor registration")]
    fn direct_add_connection_panics() {
        let reactor = Rc::new(RefCell::new(Communicator::new()));
        let reaper = SignalChildReaper::new("r", &reactor).unwrap();
        let erased: ConnectionRef = reaper;
        reactor.borrow_mut().add_connection(erased);
    }
}
