// SPDX-License-Identifier: Apache-2.0

//! UDP client and server connections.

pub mod client;
pub mod server;

pub use client::UdpClient;
pub use server::UdpServer;
