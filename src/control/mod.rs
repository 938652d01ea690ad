//! Tor control-port plumbing
//!
//! Provides the control-port client that issues `SIGNAL NEWNYM` and the
//! single-slot channel that serializes rotation requests from all views.

mod channel;
mod client;

pub use channel::CircuitChannel;
pub use client::{ControlConfig, ControlTransport, RotationError, TorController};
