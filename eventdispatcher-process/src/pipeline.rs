// SPDX-License-Identifier: Apache-2.0

//! Builds a node tree into running processes connected by pipes, and drives
//! their exit through the reactor's SIGCHLD reaper.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use eventdispatcher::buffered_fd_connection::BufferedFdConnection;
use eventdispatcher::communicator::{Communicator, ConnectionRef};
use eventdispatcher::fd_connection::FdMode;
use eventdispatcher::signal_child::{ChildStatus, SignalChildReaper, EXITED, SIGNALED};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::pipe::{new_os_pipe, TeeSource};

enum OutputTarget {
    Stdout,
    UserFd(RawFd),
    Pipe(RawFd),
}

impl OutputTarget {
    fn raw_fd(&self) -> RawFd {
        match *self {
            OutputTarget::Stdout => libc::STDOUT_FILENO,
            OutputTarget::UserFd(fd) => fd,
            OutputTarget::Pipe(fd) => fd,
        }
    }
}

/// A node tree turned into a running process tree.
///
/// `start()` forks the whole tree pre-order, `wait()` drives the reactor
/// until every node has exited, and `kill()` signals the root.
pub struct Pipeline {
    root: Rc<RefCell<Node>>,
    started: bool,
    deferred_close: Vec<RawFd>,
    tee_sources: Vec<Rc<RefCell<TeeSource>>>,
    sinks: Vec<Rc<RefCell<BufferedFdConnection>>>,
}

impl Pipeline {
    pub fn new(root: Rc<RefCell<Node>>) -> Self {
        Pipeline {
            root,
            started: false,
            deferred_close: Vec::new(),
            tee_sources: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn root(&self) -> &Rc<RefCell<Node>> {
        &self.root
    }

    /// Forks every node pre-order, then closes every pipe descriptor that
    /// only existed to cross a `fork()` boundary, and registers the tee
    /// fan-out connections it allocated with `reactor`.
    pub fn start(&mut self, reactor: &Rc<RefCell<Communicator>>) -> Result<()> {
        if self.started {
            return Err(Error::invalid("pipeline was already started"));
        }
        self.root.borrow().validate(true)?;

        let root = self.root.clone();
        let input_fd = root
            .borrow()
            .user_input_fd
            .unwrap_or(libc::STDIN_FILENO);
        self.fork_node(&root, input_fd)?;

        for fd in self.deferred_close.drain(..) {
            let _ = nix::unistd::close(fd);
        }

        for tee in &self.tee_sources {
            let conn: ConnectionRef = tee.clone();
            reactor.borrow_mut().add_connection(conn);
        }
        for sink in &self.sinks {
            let conn: ConnectionRef = sink.clone();
            reactor.borrow_mut().add_connection(conn);
        }

        self.started = true;
        Ok(())
    }

    fn fork_node(&mut self, node_rc: &Rc<RefCell<Node>>, input_fd: RawFd) -> Result<()> {
        let (output_target, next_inputs) = self.prepare_output(node_rc)?;
        let error_fd = node_rc
            .borrow()
            .user_error_fd
            .unwrap_or(libc::STDERR_FILENO);
        let is_user_input = node_rc.borrow().user_input_fd == Some(input_fd);

        let pid = spawn_child(node_rc, input_fd, output_target.raw_fd(), error_fd)?;

        {
            let mut node = node_rc.borrow_mut();
            node.pid = Some(pid);
            node.running = true;
        }

        if let OutputTarget::Pipe(fd) = output_target {
            self.deferred_close.push(fd);
        }
        if !is_user_input && input_fd != libc::STDIN_FILENO {
            self.deferred_close.push(input_fd);
        }

        let children = node_rc.borrow().next.clone();
        for (child, child_input) in children.into_iter().zip(next_inputs) {
            self.fork_node(&child, child_input)?;
        }
        Ok(())
    }

    fn prepare_output(
        &mut self,
        node_rc: &Rc<RefCell<Node>>,
    ) -> Result<(OutputTarget, Vec<RawFd>)> {
        let (next_count, user_output_fd, name) = {
            let node = node_rc.borrow();
            (node.next.len(), node.user_output_fd, node.name.clone())
        };

        match next_count {
            0 => {
                let target = match user_output_fd {
                    Some(fd) => OutputTarget::UserFd(fd),
                    None => OutputTarget::Stdout,
                };
                Ok((target, Vec::new()))
            }
            1 => {
                let (read_fd, write_fd) = new_os_pipe()?;
                Ok((OutputTarget::Pipe(write_fd), vec![read_fd]))
            }
            n => {
                let (capture_r, capture_w) = new_os_pipe()?;
                let mut sinks = Vec::with_capacity(n);
                let mut next_inputs = Vec::with_capacity(n);
                for i in 0..n {
                    let (sink_r, sink_w) = new_os_pipe()?;
                    let sink = Rc::new(RefCell::new(BufferedFdConnection::new(
                        format!("{name}-tee-{i}"),
                        sink_w,
                        FdMode::WriteOnly,
                    )?));
                    self.sinks.push(sink.clone());
                    sinks.push(sink);
                    next_inputs.push(sink_r);
                }
                let tee = Rc::new(RefCell::new(TeeSource::new(
                    format!("{name}-tee-source"),
                    capture_r,
                    sinks,
                )?));
                self.tee_sources.push(tee);
                Ok((OutputTarget::Pipe(capture_w), next_inputs))
            }
        }
    }

    /// Installs SIGCHLD listeners for every node, then drives `reactor`
    /// until all of them have reported a terminal status. Returns the
    /// root's exit code.
    pub fn wait(&mut self, reactor: &Rc<RefCell<Communicator>>) -> Result<i32> {
        if !self.started {
            return Err(Error::invalid("pipeline has not been started"));
        }
        if reactor.borrow().is_running() {
            return Err(Error::invalid(
                "cannot wait on a pipeline from inside the reactor it shares",
            ));
        }

        let mut nodes = Vec::new();
        Node::walk_pre_order(&self.root, &mut nodes);

        let reaper = SignalChildReaper::new("pipeline-sigchld", reactor)?;
        let remaining = Arc::new(AtomicUsize::new(nodes.len()));
        let mut slots = Vec::with_capacity(nodes.len());

        for node in &nodes {
            let pid = node
                .borrow()
                .pid
                .ok_or_else(|| Error::invalid("node has no pid to wait on"))?;
            let slot: Arc<Mutex<Option<ChildStatus>>> = Arc::new(Mutex::new(None));
            let slot_for_cb = slot.clone();
            let remaining_for_cb = remaining.clone();
            reaper.borrow().add_listener(pid, EXITED | SIGNALED, move |status| {
                let mut guard = slot_for_cb.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(status);
                    remaining_for_cb.fetch_sub(1, Ordering::SeqCst);
                }
            })?;
            slots.push((node.clone(), slot));
        }

        // The reaper auto-registered with `reactor` the moment the first
        // listener above was added, and will auto-remove itself once the
        // last one is (either explicitly or as each child is reaped).
        while remaining.load(Ordering::SeqCst) > 0 {
            reactor.borrow_mut().run_once()?;
        }

        for (node, slot) in slots {
            if let Some(status) = slot.lock().unwrap().take() {
                let mut n = node.borrow_mut();
                n.running = false;
                n.exit_code = status.exit_code;
                n.terminate_signal = status.terminate_signal;
            }
        }

        Ok(self.root.borrow().exit_code.unwrap_or(-1))
    }

    /// Delivers `sig` to the root process.
    pub fn kill(&self, sig: i32) -> Result<()> {
        let pid = self
            .root
            .borrow()
            .pid
            .ok_or_else(|| Error::invalid("pipeline has no running root process"))?;
        let rc = unsafe { libc::kill(pid, sig) };
        if rc < 0 {
            return Err(Error::Os(nix::errno::Errno::last()));
        }
        Ok(())
    }
}

fn build_argv(command: &[String]) -> Result<Vec<CString>> {
    command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .map_err(|_| Error::invalid(format!("argument {arg:?} contains a NUL byte")))
        })
        .collect()
}

fn build_envp(env: &BTreeMap<String, String>, force_env: bool) -> Result<Vec<CString>> {
    let mut merged: BTreeMap<String, String> = if force_env {
        BTreeMap::new()
    } else {
        std::env::vars().collect()
    };
    if force_env {
        merged = env.clone();
    } else {
        for (key, value) in env {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| {
            CString::new(format!("{key}={value}")).map_err(|_| {
                Error::invalid(format!("environment entry {key:?} contains a NUL byte"))
            })
        })
        .collect()
}

fn spawn_child(
    node_rc: &Rc<RefCell<Node>>,
    input_fd: RawFd,
    output_fd: RawFd,
    error_fd: RawFd,
) -> Result<libc::pid_t> {
    let node = node_rc.borrow();
    if node.command.is_empty() {
        return Err(Error::invalid(format!("node {:?} has an empty command", node.name)));
    }
    let argv = build_argv(&node.command)?;
    let envp = build_envp(&node.env, node.force_env)?;
    let program = argv[0].clone();
    let cwd = node.cwd.clone();
    let name = node.name.clone();
    drop(node);

    match unsafe { nix::unistd::fork() }? {
        nix::unistd::ForkResult::Child => {
            if let Some(dir) = &cwd {
                if nix::unistd::chdir(dir.as_path()).is_err() {
                    unsafe { libc::_exit(1) };
                }
            }
            if unsafe { libc::dup2(input_fd, libc::STDIN_FILENO) } < 0
                || unsafe { libc::dup2(output_fd, libc::STDOUT_FILENO) } < 0
                || unsafe { libc::dup2(error_fd, libc::STDERR_FILENO) } < 0
            {
                unsafe { libc::_exit(1) };
            }
            let _ = nix::unistd::execvpe(&program, &argv, &envp);
            // execvpe only returns on failure.
            unsafe { libc::_exit(1) }
        }
        nix::unistd::ForkResult::Parent { child } => {
            log::debug!(target: "eventdispatcher-process", "forked node {name:?} as pid {}", child.as_raw());
            Ok(child.as_raw())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_argv_rejects_nul_bytes() {
        let command = vec!["bad\0arg".to_string()];
        assert!(build_argv(&command).is_err());
    }

    #[test]
    fn build_envp_force_env_ignores_ambient() {
        let mut env = BTreeMap::new();
        env.insert("ONLY".to_string(), "value".to_string());
        let envp = build_envp(&env, true).unwrap();
        assert_eq!(envp.len(), 1);
        assert_eq!(envp[0].to_str().unwrap(), "ONLY=value");
    }

    #[test]
    fn build_envp_merge_does_not_overwrite_ambient() {
        std::env::set_var("PIPELINE_TEST_VAR", "ambient");
        let mut env = BTreeMap::new();
        env.insert("PIPELINE_TEST_VAR".to_string(), "overridden".to_string());
        let envp = build_envp(&env, false).unwrap();
        let entry = envp
            .iter()
            .find(|e| e.to_str().unwrap().starts_with("PIPELINE_TEST_VAR="))
            .unwrap();
        assert_eq!(entry.to_str().unwrap(), "PIPELINE_TEST_VAR=ambient");
        std::env::remove_var("PIPELINE_TEST_VAR");
    }

    #[test]
    fn new_pipeline_is_not_started() {
        let root = Node::new("root", vec!["true".to_string()]);
        let pipeline = Pipeline::new(root);
        assert!(!pipeline.started);
    }
}
