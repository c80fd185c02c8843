//! TCP data channel for parallel transfers.
//!
//! Each sender lane holds one persistent TCP connection to the receiving
//! peer. The connection is authenticated once with a shared token, then
//! carries strictly alternating request/response frames for the four
//! transfer operations.
//!
//! # Wire format
//!
//! See [`wire`] module for the frame layout.

pub mod client;
pub mod error;
pub mod server;
pub mod token;
pub mod wire;

pub use client::TcpPeerClient;
pub use error::DataChannelError;
pub use server::TcpDataServer;
pub use token::{generate_token, validate_token};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the authentication handshake.
pub const TCP_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
