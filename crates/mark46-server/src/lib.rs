//! MARK-46 signaling server — WebSocket peer dispatch with rooms.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for server operations.
pub mod error;
/// Hook tables for the four application events.
pub mod events;
/// Upgrade-request validation and handshake responses.
pub mod handshake;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Connected peers and room membership.
pub mod registry;
/// Accept loop, shared server state, dispatch and broadcast.
pub mod server;

pub use registry::{Peer, PeerState};
pub use server::{run, ServerState};
