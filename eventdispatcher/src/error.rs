// SPDX-License-Identifier: Apache-2.0

//! Typed error surface for the reactor, connections, and message layer.
//!
//! Categories follow the behavioral split the crate is held to: a failure
//! is either a bad construction parameter (`Initialization`), an OS call
//! that failed (`Runtime`), an internal consistency violation that should
//! never happen (`Logic`), a forbidden re-entrant call (`Recursive`), an
//! operation performed on something that was never started (`NotStarted`),
//! or a malformed/invalid message (`Protocol`).

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("runtime error (errno {0}): {1}")]
    Errno(i32, String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("recursive call: {0}")]
    Recursive(String),

    #[error("not started: {0}")]
    NotStarted(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn init(msg: impl fmt::Display) -> Self {
        Error::Initialization(msg.to_string())
    }

    pub fn runtime(msg: impl fmt::Display) -> Self {
        Error::Runtime(msg.to_string())
    }

    pub fn logic(msg: impl fmt::Display) -> Self {
        Error::Logic(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Error::Protocol(msg.to_string())
    }

    /// Classifies the errno captured from a failed `poll()`/`waitid()`/etc.
    /// call: EFAULT/EINVAL/ENOMEM get their own branch, everything else
    /// carries the errno verbatim.
    pub fn from_errno(context: &str, errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::EFAULT => {
                Error::Errno(errno as i32, format!("{context}: bad address (EFAULT)"))
            }
            nix::errno::Errno::EINVAL => {
                Error::Errno(errno as i32, format!("{context}: invalid argument (EINVAL)"))
            }
            nix::errno::Errno::ENOMEM => {
                Error::Errno(errno as i32, format!("{context}: out of memory (ENOMEM)"))
            }
            other => Error::Errno(other as i32, format!("{context}: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
