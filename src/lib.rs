//! # Atrium
//!
//! A memcached-compatible binary-protocol front-end server.
//!
//! Atrium multiplexes client connections across a fixed pool of worker
//! reactors and dispatches framed binary requests through a privilege
//! gate into a pluggable storage engine (the "bucket"), with:
//! - Full binary protocol framing, including alt-request frame infos
//! - Out-of-order ("reorder") execution with barrier semantics
//! - Server-initiated push messages over duplex connections
//! - Full-duplex change-data-capture (CDC) producer streams
//! - SASL and X.509 authentication with RBAC privilege checks
//! - TLS via rustls (optional feature)
//!
//! ## Example
//!
//! ```no_run
//! use atrium::{Server, Settings, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Arc::new(Server::new(Settings::default())?);
//!     server.register_memory_bucket("default");
//!     server.run().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications,
    missing_docs
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::type_complexity // Signal channels carry boxed trait objects
)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Command dispatch, validation and executors.
pub mod commands;
/// CDC producer shim.
pub mod dcp;
/// Storage engine interface and the in-memory engine.
pub mod engine;
/// Error types and result aliases.
pub mod error;
/// Binary wire protocol.
pub mod protocol;
/// Authentication, authorization and audit.
pub mod security;
/// The TCP front end: reactors, connections, state machine.
pub mod server;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use error::{Error, Result};
pub use protocol::{ClientOpcode, Frame, Magic, PacketParser, Status};
pub use server::{Server, ServerContext, Settings};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default maximum packet body size (30 MiB).
pub const MAX_PACKET_SIZE: usize = 30 * 1024 * 1024;
