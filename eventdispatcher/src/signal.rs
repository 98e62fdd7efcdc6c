// SPDX-License-Identifier: Apache-2.0

//! A signal-descriptor connection: blocks the signal in the process mask
//! and receives it instead through a pollable `signalfd`.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::connection::{Connection, ConnectionBase, ConnectionKind};
use crate::error::{Error, Result};

pub struct SignalConnection {
    base: ConnectionBase,
    signal_fd: SignalFd,
    signal: Signal,
    on_signal: Option<Box<dyn FnMut(&mut SignalConnection)>>,
}

impl SignalConnection {
    /// Blocks `signal` process-wide and creates a non-blocking `signalfd`
    /// to receive it instead.
    pub fn new(name: impl Into<String>, signal: Signal) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(signal);
        mask.thread_block()
            .map_err(|e| Error::from_errno("sigprocmask", e))?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::from_errno("signalfd", e))?;
        Ok(SignalConnection {
            base: ConnectionBase::new(name),
            signal_fd,
            signal,
            on_signal: None,
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn on_signal(&mut self, callback: impl FnMut(&mut SignalConnection) + 'static) {
        self.on_signal = Some(Box::new(callback));
    }

    /// Drains every pending `signalfd_siginfo` record without necessarily
    /// acting on its contents; the caller's callback is invoked once per
    /// readiness event rather than once per queued record, matching how
    /// other readiness sources behave.
    fn drain(&mut self) {
        loop {
            match self.signal_fd.read_signal() {
                Ok(Some(_info)) => continue,
                Ok(None) => break,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

impl Connection for SignalConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn raw_fd(&self) -> RawFd {
        self.signal_fd.as_raw_fd()
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Signal
    }

    fn process_signal(&mut self) {
        self.drain();
        if let Some(mut callback) = self.on_signal.take() {
            callback(self);
            self.on_signal = Some(callback);
        }
    }
}
