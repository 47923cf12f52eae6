//! Common types and protocol plumbing shared across the MARK-46 stack.
//!
//! This crate provides:
//! - The incremental RFC 6455 frame receiver and frame encoder ([`wire`])
//! - The 4-byte signal envelope codec ([`signal`])
//! - Close codes and canonical reason strings ([`close`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod close;
pub mod signal;
pub mod types;
pub mod wire;

pub use signal::{SignalBody, SignalError};
pub use types::PeerId;
pub use wire::{FrameError, FrameReceiver, ReceiverEvent};
