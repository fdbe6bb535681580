//! WebRTC signaling relay core
//!
//! This crate provides:
//! - A registry of connected peers keyed by their self-chosen id
//! - Envelope parsing for the browser signaling protocol
//! - The per-connection WebSocket router that forwards envelopes between peers

pub mod envelope;
pub mod registry;
mod server;


pub use envelope::{EnvelopeError, Inbound, Outbound};
pub use registry::{DeliveryError, PeerHandle, Registry};
pub use server::{ws_handler, RelayState};
