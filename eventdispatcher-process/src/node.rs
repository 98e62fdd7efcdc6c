// SPDX-License-Identifier: Apache-2.0

//! A single subprocess stage in a pipeline tree.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{Error, Result};

/// One command to run, its environment/working-directory overrides, and the
/// next stage(s) its output feeds into.
///
/// Zero `next` nodes makes this a terminal node (its output goes to a
/// user-supplied descriptor or inherited `STDOUT`); one makes it a direct
/// pipe into the next node's `stdin`; more than one makes it a tee that
/// fans its single output stream out to every next node.
pub struct Node {
    pub(crate) name: String,
    pub(crate) command: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) force_env: bool,
    pub(crate) next: Vec<Rc<RefCell<Node>>>,

    pub(crate) user_input_fd: Option<RawFd>,
    pub(crate) user_output_fd: Option<RawFd>,
    pub(crate) user_error_fd: Option<RawFd>,

    pub(crate) pid: Option<libc::pid_t>,
    pub(crate) running: bool,
    pub(crate) exit_code: Option<i32>,
    pub(crate) terminate_signal: Option<i32>,
}

impl Node {
    /// `command[0]` is the program (searched on `PATH` via `execvpe`); the
    /// rest are its arguments.
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Node {
            name: name.into(),
            command,
            cwd: None,
            env: BTreeMap::new(),
            force_env: false,
            next: Vec::new(),
            user_input_fd: None,
            user_output_fd: None,
            user_error_fd: None,
            pid: None,
            running: false,
            exit_code: None,
            terminate_signal: None,
        }))
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// When set, the child's environment is exactly the map built by
    /// [`set_env`](Self::set_env) — the ambient process environment is not
    /// merged in.
    pub fn set_force_env(&mut self, force: bool) {
        self.force_env = force;
    }

    /// Reads from `fd` instead of the previous node's output (only valid on
    /// the root node; see the "first node" invariant checked at `start()`).
    pub fn set_user_input_fd(&mut self, fd: RawFd) {
        self.user_input_fd = Some(fd);
    }

    /// Writes to `fd` instead of `STDOUT` (only valid on a terminal node).
    pub fn set_user_output_fd(&mut self, fd: RawFd) {
        self.user_output_fd = Some(fd);
    }

    /// Writes stderr to `fd` instead of inheriting `STDERR`.
    pub fn set_user_error_fd(&mut self, fd: RawFd) {
        self.user_error_fd = Some(fd);
    }

    pub fn add_next(parent: &Rc<RefCell<Node>>, child: Rc<RefCell<Node>>) {
        parent.borrow_mut().next.push(child);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_empty()
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn terminate_signal(&self) -> Option<i32> {
        self.terminate_signal
    }

    pub(crate) fn validate(&self, is_root: bool) -> Result<()> {
        if self.user_output_fd.is_some() && !self.is_terminal() {
            return Err(Error::invalid(format!(
                "node {:?} has a user output descriptor but is not terminal",
                self.name
            )));
        }
        if self.user_input_fd.is_some() && !is_root {
            return Err(Error::invalid(format!(
                "node {:?} has a user input descriptor but is not the first node",
                self.name
            )));
        }
        for child in &self.next {
            child.borrow().validate(false)?;
        }
        Ok(())
    }

    /// Every node in the subtree rooted at `self`, pre-order.
    pub(crate) fn walk_pre_order(self_rc: &Rc<RefCell<Node>>, out: &mut Vec<Rc<RefCell<Node>>>) {
        out.push(self_rc.clone());
        for child in &self_rc.borrow().next {
            Node::walk_pre_order(child, out);
        }
    }
}
