use super::capture::CaptureProfile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device cannot deliver {0}")]
    Unsupported(CaptureProfile),

    #[error("capture device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied (camera: {camera}, microphone: {microphone})")]
    PermissionDenied { camera: bool, microphone: bool },

    #[error("local media acquisition failed: {0}")]
    Acquisition(#[from] CaptureError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("media session already stopped")]
    Stopped,
}
