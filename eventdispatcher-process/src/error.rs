// SPDX-License-Identifier: Apache-2.0

//! Small, focused error enum for pipeline construction and execution,
//! separate from the reactor's own error surface: a bad topology or a
//! string containing a NUL byte is a caller mistake, not a reactor fault.

use std::ffi::NulError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),

    #[error("argument or environment string contains a NUL byte: {0}")]
    NulByte(#[from] NulError),

    #[error("os call failed: {0}")]
    Os(#[from] nix::Error),

    #[error(transparent)]
    Reactor(#[from] eventdispatcher::Error),
}

impl Error {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Error::Invalid(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
