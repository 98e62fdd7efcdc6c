// SPDX-License-Identifier: Apache-2.0

//! A root command feeds three next-nodes (a tee): each next-node should see
//! the full output and exit cleanly, and so should the root.

use std::cell::RefCell;
use std::rc::Rc;

use eventdispatcher::communicator::Communicator;
use eventdispatcher_process::{Node, Pipeline};

#[test]
fn three_next_nodes_each_receive_full_output() {
    let reactor = Rc::new(RefCell::new(Communicator::new()));

    let root = Node::new("root", vec!["printf".to_string(), "x\n".to_string()]);
    let mut counters = Vec::new();
    for i in 0..3 {
        let child = Node::new(format!("wc-{i}"), vec!["wc".to_string(), "-c".to_string()]);
        Node::add_next(&root, child.clone());
        counters.push(child);
    }

    let mut pipeline = Pipeline::new(root.clone());
    pipeline.start(&reactor).unwrap();
    let exit_code = pipeline.wait(&reactor).unwrap();

    assert_eq!(exit_code, 0, "root command should exit cleanly");
    for child in &counters {
        assert_eq!(child.borrow().exit_code(), Some(0));
    }
}
