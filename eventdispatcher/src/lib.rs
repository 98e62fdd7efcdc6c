// SPDX-License-Identifier: Apache-2.0

//! A single-threaded, poll-driven reactor: connections, timers, signals, a
//! line-framed message protocol with a priority dispatch table, and a
//! handful of ready-made connection types (TCP/Unix streams, UDP, permanent
//! reconnect clients, a SIGCHLD reaper, a socket-listening watcher).
//!
//! The [`Communicator`](communicator::Communicator) owns the connection set
//! and drives the loop; everything else is a [`Connection`](connection::Connection)
//! implementation that can be registered with one.

pub mod buffered_fd_connection;
pub mod clock;
pub mod communicator;
pub mod connection;
pub mod error;
pub mod fd_connection;
pub mod message;
pub mod permanent_connection;
pub mod signal;
pub mod signal_child;
pub mod socket_events;
pub mod stream;
pub mod thread_done;
pub mod timer;
pub mod udp;

pub use communicator::{Communicator, ConnectionRef};
pub use connection::{Connection, ConnectionBase, ConnectionKind};
pub use error::{Error, Result};
pub use message::{Dispatcher, Message, MessageDefinition, SchemaLoader};
pub use permanent_connection::{PermanentConnection, StreamMode};
pub use signal::SignalConnection;
pub use signal_child::SignalChildReaper;
pub use socket_events::SocketEventsWatcher;
pub use thread_done::{ThreadDone, ThreadDoneSignal};
pub use timer::Timer;
