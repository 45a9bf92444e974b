//! Signaling protocol client.
//!
//! Owns one control channel at a time: registration handshake, queue
//! membership, relay to the matched peer and reconnection with backoff.

pub mod client;
pub mod error;

pub use client::{Credentials, SignalClient, SignalConfig, SignalEvent};
pub use error::SignalError;
