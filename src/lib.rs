//! Random video chat client: signaling, WebRTC media and the call
//! orchestrator that ties them together.

pub mod auth;
pub mod call;
pub mod config;
pub mod media;
pub mod services;
pub mod signal;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub mod types {
    pub use ranchat_core::types::*;
    pub mod events;
}

pub use call::{CallDependencies, CallHandle, CallOrchestrator};
pub use config::AppConfig;
