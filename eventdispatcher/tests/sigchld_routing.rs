// SPDX-License-Identifier: Apache-2.0

//! Two children are forked and registered with the SIGCHLD reaper: one
//! exits normally, the other is killed by SIGTERM. Each should report
//! exactly once, with the right exit code / terminate signal.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eventdispatcher::communicator::Communicator;
use eventdispatcher::signal_child::{ChildStatus, SignalChildReaper, EXITED, SIGNALED};

fn spawn_child_that_exits(code: i32) -> libc::pid_t {
    match unsafe { nix::unistd::fork() }.unwrap() {
        nix::unistd::ForkResult::Child => unsafe { libc::_exit(code) },
        nix::unistd::ForkResult::Parent { child } => child.as_raw(),
    }
}

fn spawn_child_that_sleeps() -> libc::pid_t {
    match unsafe { nix::unistd::fork() }.unwrap() {
        nix::unistd::ForkResult::Child => {
            std::thread::sleep(Duration::from_secs(30));
            unsafe { libc::_exit(0) }
        }
        nix::unistd::ForkResult::Parent { child } => child.as_raw(),
    }
}

#[test]
fn each_child_reports_exactly_once_with_correct_status() {
    let reactor = Rc::new(RefCell::new(Communicator::new()));
    let reaper = SignalChildReaper::new("sigchld-test", &reactor).unwrap();

    let pid_a = spawn_child_that_exits(7);
    let pid_b = spawn_child_that_sleeps();

    let calls_a: Arc<Mutex<Vec<ChildStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let calls_b: Arc<Mutex<Vec<ChildStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let calls_a2 = calls_a.clone();
    let calls_b2 = calls_b.clone();

    reaper
        .borrow()
        .add_listener(pid_a, EXITED | SIGNALED, move |status| {
            calls_a2.lock().unwrap().push(status);
        })
        .unwrap();
    reaper
        .borrow()
        .add_listener(pid_b, EXITED | SIGNALED, move |status| {
            calls_b2.lock().unwrap().push(status);
        })
        .unwrap();

    unsafe {
        libc::kill(pid_b, libc::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while (calls_a.lock().unwrap().is_empty() || calls_b.lock().unwrap().is_empty())
        && Instant::now() < deadline
    {
        reactor.borrow_mut().run_once().unwrap();
    }

    let a = calls_a.lock().unwrap();
    let b = calls_b.lock().unwrap();
    assert_eq!(a.len(), 1, "child A should report exactly once");
    assert_eq!(b.len(), 1, "child B should report exactly once");
    assert_eq!(a[0].exit_code, Some(7));
    assert_eq!(a[0].terminate_signal, None);
    assert_eq!(b[0].terminate_signal, Some(libc::SIGTERM));
    assert_eq!(b[0].exit_code, None);
}
