// SPDX-License-Identifier: Apache-2.0

//! The abstract readiness source polled by the reactor.
//!
//! Rather than a class hierarchy, concrete connection types embed a
//! [`ConnectionBase`] for the shared bookkeeping fields and implement the
//! [`Connection`] trait, whose default methods delegate to that base: a sum
//! type for kind plus data-driven tables instead of deep inheritance.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// What kind of readiness events the reactor should request for a
/// connection's descriptor. Timer-only connections have no descriptor at
/// all and are skipped when building the poll vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Listener,
    Signal,
    Reader,
    Writer,
    ReaderWriter,
    TimerOnly,
}

pub const DEFAULT_PRIORITY: u8 = 100;

/// Shared connection bookkeeping: name, priority, enable/done flags, the
/// two timer fields, and the poll-iteration snapshot fields.
#[derive(Debug, Clone)]
pub struct ConnectionBase {
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) enabled: bool,
    pub(crate) done: bool,

    /// `-1` means disabled; otherwise `>= 10` microseconds.
    pub(crate) timeout_delay_us: i64,
    /// Fixed-phase grid anchor + running "next tick" value.
    pub(crate) timeout_next_date_us: i64,
    /// `-1` means unset; otherwise a one-shot absolute date in microseconds.
    pub(crate) timeout_date_us: i64,

    /// Snapshot of `get_timeout_timestamp()` taken once per poll iteration.
    pub(crate) saved_timeout_timestamp_us: i64,

    pub(crate) event_limit: u32,
    pub(crate) processing_time_limit_us: i64,
}

impl Default for ConnectionBase {
    fn default() -> Self {
        ConnectionBase {
            name: String::new(),
            priority: DEFAULT_PRIORITY,
            enabled: true,
            done: false,
            timeout_delay_us: -1,
            timeout_next_date_us: -1,
            timeout_date_us: -1,
            saved_timeout_timestamp_us: -1,
            event_limit: u32::MAX,
            processing_time_limit_us: i64::MAX,
        }
    }
}

impl ConnectionBase {
    pub fn new(name: impl Into<String>) -> Self {
        ConnectionBase {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// An abstract readiness source registered with the [`Communicator`](crate::communicator::Communicator).
pub trait Connection {
    fn base(&self) -> &ConnectionBase;
    fn base_mut(&mut self) -> &mut ConnectionBase;

    /// The descriptor to poll, or `-1` if this connection has none (e.g. a
    /// plain timer).
    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::TimerOnly
    }

    fn valid_socket(&self) -> bool {
        self.kind() == ConnectionKind::TimerOnly || self.raw_fd() >= 0
    }

    /// Connections that add/remove themselves from the reactor as their own
    /// listener count transitions to/from zero. `Communicator::add_connection`
    /// and `remove_connection` refuse (panic) direct calls against these —
    /// only the connection's own register/unregister hooks may touch it.
    fn self_managed(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    fn set_name(&mut self, name: impl Into<String>)
    where
        Self: Sized,
    {
        self.base_mut().name = name.into();
    }

    fn priority(&self) -> u8 {
        self.base().priority
    }

    /// Takes `i32` (not `u8`) so out-of-range values can be rejected rather
    /// than silently truncated.
    fn set_priority(&mut self, priority: i32) -> Result<()> {
        if !(0..=255).contains(&priority) {
            return Err(Error::init(format!(
                "priority {priority} is out of range [0,255]"
            )));
        }
        self.base_mut().priority = priority as u8;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.base().enabled
    }

    fn set_enable(&mut self, enable: bool) {
        self.base_mut().enabled = enable;
    }

    fn is_done(&self) -> bool {
        self.base().done
    }

    fn mark_done(&mut self) {
        self.base_mut().done = true;
        self.base_mut().enabled = false;
    }

    /// Periodic delay in microseconds; `-1` disables it. Must be `-1` or
    /// `>= 10`.
    fn get_timeout_delay(&self) -> i64 {
        self.base().timeout_delay_us
    }

    fn set_timeout_delay(&mut self, delay_us: i64) -> Result<()> {
        if delay_us != -1 && delay_us < 10 {
            return Err(Error::init(format!(
                "timeout delay {delay_us} is invalid: must be -1 or >= 10 microseconds"
            )));
        }
        let base = self.base_mut();
        base.timeout_delay_us = delay_us;
        if delay_us == -1 {
            base.timeout_next_date_us = -1;
        } else {
            base.timeout_next_date_us = crate::clock::current_usec() + delay_us;
        }
        Ok(())
    }

    /// One-shot absolute date in microseconds; `-1` means unset.
    fn get_timeout_date(&self) -> i64 {
        self.base().timeout_date_us
    }

    fn set_timeout_date(&mut self, date_us: i64) -> Result<()> {
        if date_us < -1 {
            return Err(Error::init(format!(
                "timeout date {date_us} cannot be less than -1"
            )));
        }
        self.base_mut().timeout_date_us = date_us;
        Ok(())
    }

    /// The absolute date (microseconds) this connection should next time
    /// out at, or `-1` if neither timer field is armed.
    fn get_timeout_timestamp(&self) -> i64 {
        let base = self.base();
        if base.timeout_date_us != -1 {
            base.timeout_date_us
        } else {
            base.timeout_next_date_us
        }
    }

    /// Advances the fixed-phase tick grid (`start + k*delay`), skipping any
    /// missed ticks rather than bursting through them. Also clears a
    /// one-shot date that has fired. Called once per poll iteration, after
    /// the timeout has been recognized as due.
    fn calculate_next_tick(&mut self) {
        let base = self.base_mut();
        if base.timeout_date_us != -1 {
            base.timeout_date_us = -1;
        }
        if base.timeout_delay_us == -1 {
            return;
        }
        let now = crate::clock::current_usec();
        let gap = now - base.timeout_next_date_us;
        if gap < 0 {
            return;
        }
        let delay = base.timeout_delay_us;
        let ticks = (gap + delay - 1) / delay;
        base.timeout_next_date_us += ticks * delay;
    }

    fn save_timeout_timestamp(&mut self) {
        let ts = self.get_timeout_timestamp();
        self.base_mut().saved_timeout_timestamp_us = ts;
    }

    fn saved_timeout_timestamp(&self) -> i64 {
        self.base().saved_timeout_timestamp_us
    }

    fn event_limit(&self) -> u32 {
        self.base().event_limit
    }

    fn set_event_limit(&mut self, limit: u32) {
        self.base_mut().event_limit = limit;
    }

    fn processing_time_limit_us(&self) -> i64 {
        self.base().processing_time_limit_us
    }

    fn set_processing_time_limit_us(&mut self, limit_us: i64) {
        self.base_mut().processing_time_limit_us = limit_us;
    }

    // -- readiness callbacks -------------------------------------------
    //
    // process_error/hup/invalid return whether the reactor should remove
    // the connection after the call. The default is `true`; overrides such
    // as the permanent-reconnect client return `false` while they are not
    // `done`.

    fn process_timeout(&mut self) {}
    fn process_read(&mut self) {}

    /// Returns whether the reactor should remove this connection right
    /// after the call. Used by buffered connections that have emptied
    /// their output queue and were marked for shutdown: a `done` flag
    /// instructs `process_empty_buffer` to remove the connection.
    fn process_write(&mut self) -> bool {
        false
    }

    fn process_accept(&mut self) {}
    fn process_signal(&mut self) {}
    fn process_empty_buffer(&mut self) {}

    fn process_error(&mut self) -> bool {
        log::warn!(target: "eventdispatcher", "connection {:?} raised an error, removing", self.name());
        true
    }

    fn process_hup(&mut self) -> bool {
        log::debug!(target: "eventdispatcher", "connection {:?} hung up, removing", self.name());
        true
    }

    fn process_invalid(&mut self) -> bool {
        log::warn!(target: "eventdispatcher", "connection {:?} has an invalid descriptor, removing", self.name());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(ConnectionBase);
    impl Connection for Dummy {
        fn base(&self) -> &ConnectionBase {
            &self.0
        }
        fn base_mut(&mut self) -> &mut ConnectionBase {
            &mut self.0
        }
    }

    #[test]
    fn priority_range_rejected() {
        let mut d = Dummy(ConnectionBase::new("d"));
        assert!(d.set_priority(-1).is_err());
        assert!(d.set_priority(256).is_err());
        assert!(d.set_priority(0).is_ok());
        assert!(d.set_priority(255).is_ok());
    }

    #[test]
    fn timeout_delay_minimum() {
        let mut d = Dummy(ConnectionBase::new("d"));
        assert!(d.set_timeout_delay(5).is_err());
        assert!(d.set_timeout_delay(-1).is_ok());
        assert!(d.set_timeout_delay(10).is_ok());
    }

    #[test]
    fn tick_grid_skips_missed_ticks() {
        let mut d = Dummy(ConnectionBase::new("d"));
        let now = crate::clock::current_usec();
        d.0.timeout_delay_us = 50;
        d.0.timeout_next_date_us = now - 175; // 3.5 missed periods at delay 50
        d.calculate_next_tick();
        // next date must be >= now and on the start+k*delay grid
        assert!(d.0.timeout_next_date_us >= now);
        assert_eq!((d.0.timeout_next_date_us - (now - 175)) % 50, 0);
    }

    #[test]
    fn one_shot_date_autoclears() {
        let mut d = Dummy(ConnectionBase::new("d"));
        d.set_timeout_date(42).unwrap();
        assert_eq!(d.get_timeout_date(), 42);
        d.calculate_next_tick();
        assert_eq!(d.get_timeout_date(), -1);
    }
}
