// SPDX-License-Identifier: Apache-2.0

//! A standalone timer connection: no descriptor, just the periodic/one-shot
//! timeout fields inherited from [`ConnectionBase`] plus a callback.

use crate::connection::{Connection, ConnectionBase};

/// A timer-only connection. Construct with [`Timer::new`] for a periodic
/// tick, or [`Timer::fire_once_now`] for a one-shot that fires on the very
/// first reactor iteration it participates in.
pub struct Timer {
    base: ConnectionBase,
    on_timeout: Option<Box<dyn FnMut(&mut Timer)>>,
}

impl Timer {
    /// A periodic timer with delay `delay_us` (must be `>= 10`, enforced by
    /// [`Connection::set_timeout_delay`]).
    pub fn new(name: impl Into<String>, delay_us: i64) -> crate::error::Result<Self> {
        let mut timer = Timer {
            base: ConnectionBase::new(name),
            on_timeout: None,
        };
        timer.set_timeout_delay(delay_us)?;
        Ok(timer)
    }

    /// A one-shot timer armed to fire immediately (at or before "now"),
    /// i.e. on the very next `process_timeout` pass.
    pub fn fire_once_now(name: impl Into<String>) -> Self {
        let mut timer = Timer {
            base: ConnectionBase::new(name),
            on_timeout: None,
        };
        let now = crate::clock::current_usec();
        timer.base.timeout_date_us = now;
        timer
    }

    /// A one-shot timer armed to fire at the given absolute microsecond
    /// timestamp.
    pub fn fire_once_at(name: impl Into<String>, date_us: i64) -> crate::error::Result<Self> {
        let mut timer = Timer {
            base: ConnectionBase::new(name),
            on_timeout: None,
        };
        timer.set_timeout_date(date_us)?;
        Ok(timer)
    }

    pub fn on_timeout(&mut self, callback: impl FnMut(&mut Timer) + 'static) {
        self.on_timeout = Some(Box::new(callback));
    }
}

impl Connection for Timer {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn process_timeout(&mut self) {
        if let Some(mut callback) = self.on_timeout.take() {
            callback(self);
            self.on_timeout = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{Communicator, ConnectionRef};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn fire_once_now_fires_exactly_once() {
        let count = Rc::new(Cell::new(0));
        let mut timer = Timer::fire_once_now("t");
        let count2 = count.clone();
        timer.on_timeout(move |t| {
            count2.set(count2.get() + 1);
            t.mark_done();
        });
        let conn: ConnectionRef = Rc::new(RefCell::new(timer));
        let mut reactor = Communicator::new();
        reactor.add_connection(conn);
        reactor.run().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn periodic_timer_rejects_sub_minimum_delay() {
        assert!(Timer::new("t", 5).is_err());
        assert!(Timer::new("t", 10).is_ok());
    }
}
