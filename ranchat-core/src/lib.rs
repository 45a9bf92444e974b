pub mod backoff;
pub mod generation;
pub mod ice;
pub mod net;
pub mod protocol;
pub mod sdp;
pub mod types;
