//! TCP wire transport for chunkferry.
//!
//! One crate, both ends: [`WireTransport`] is the client-side
//! [`ChunkTransport`](chunkferry_transfer::ChunkTransport)
//! implementation the upload scheduler plugs into, and [`ChunkServer`]
//! is a reference server that stores parts, assembles finished files,
//! and answers pre-flight status queries.
//!
//! # Wire format
//!
//! See [`wire`] module for the binary protocol specification.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::WireTransport;
pub use error::WireError;
pub use server::ChunkServer;
pub use wire::{generate_token, validate_token};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the authentication handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a partial upload may sit untouched before the sweep
/// removes it.
pub const PART_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Interval between sweeps of stale partial uploads.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
