// SPDX-License-Identifier: Apache-2.0

//! A periodic timer that blocks past several of its own ticks inside a
//! callback must not burst through the missed ticks: the next fire lands on
//! the smallest `t0 + n*delay >= now`, and exactly once.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use eventdispatcher::communicator::{Communicator, ConnectionRef};
use eventdispatcher::timer::Timer;
use eventdispatcher::Connection;

#[test]
fn missed_ticks_are_skipped_not_queued() {
    let mut reactor = Communicator::new();
    let mut timer = Timer::new("t", 50_000).unwrap();

    let fire_count = Rc::new(Cell::new(0));
    let fire_count2 = fire_count.clone();
    timer.on_timeout(move |t| {
        let n = fire_count2.get() + 1;
        fire_count2.set(n);
        if n == 1 {
            std::thread::sleep(Duration::from_millis(175));
        } else {
            t.mark_done();
        }
    });

    let conn: ConnectionRef = Rc::new(RefCell::new(timer));
    reactor.add_connection(conn);

    // Two ticks: the first blocks for 175ms, the second must be the very
    // next call (not 3-4 queued calls for the missed period).
    reactor.run_once().unwrap();
    reactor.run_once().unwrap();

    assert_eq!(fire_count.get(), 2);
}
