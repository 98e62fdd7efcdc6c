// SPDX-License-Identifier: Apache-2.0

//! Monotonic microsecond clock shared by the timer/connection logic.
//!
//! `connection::calculate_next_tick()` compares absolute dates expressed in
//! microseconds against this clock rather than wall-clock time, so a system
//! clock step never skips or re-fires a tick.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed since the first call to any clock function in this
/// process. Monotonic, never decreases.
pub fn current_usec() -> i64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let a = current_usec();
        let b = current_usec();
        assert!(b >= a);
    }
}
