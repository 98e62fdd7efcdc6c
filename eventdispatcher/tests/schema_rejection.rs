// SPDX-License-Identifier: Apache-2.0

//! A dispatcher with a `LOGIN` schema (user required, password forbidden)
//! drops messages that violate it instead of running their callback.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use eventdispatcher::message::dispatcher::{exact, Dispatcher};
use eventdispatcher::message::wire::parse;

fn write_login_conf(dir: &std::path::Path) {
    let mut f = std::fs::File::create(dir.join("LOGIN.conf")).unwrap();
    f.write_all(b"[user]\ntype = string\nflags = required\n\n[password]\ntype = string\nflags = forbidden\n")
        .unwrap();
}

#[test]
fn forbidden_parameter_drops_message_before_callback() {
    let dir = tempfile::tempdir().unwrap();
    write_login_conf(dir.path());

    let mut dispatcher = Dispatcher::new();
    dispatcher.set_definition_path(dir.path().to_str().unwrap());

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired2 = fired.clone();
    dispatcher.add_match(
        "login",
        exact("LOGIN"),
        move |msg| fired2.borrow_mut().push(msg.clone()),
        0,
    );

    let mut ok = parse("LOGIN user=bob\n").unwrap();
    assert!(dispatcher.dispatch(&mut ok));
    assert_eq!(fired.borrow().len(), 1);

    let mut rejected = parse("LOGIN password=x\n").unwrap();
    assert!(!dispatcher.dispatch(&mut rejected));
    assert_eq!(fired.borrow().len(), 1);
}
