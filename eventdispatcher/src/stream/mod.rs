// SPDX-License-Identifier: Apache-2.0

//! Stream (TCP and Unix-domain) connections: listeners that accept and
//! hand off a [`BufferedFdConnection`](crate::buffered_fd_connection::BufferedFdConnection),
//! plus a message-oriented variant that layers line parsing and dispatch
//! on top.

pub mod message_connection;
pub mod tcp;
pub mod unix_stream;

pub use message_connection::MessageConnection;
pub use tcp::{TcpClient, TcpListener};
pub use unix_stream::{UnixStreamClient, UnixStreamListener};
