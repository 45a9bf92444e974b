//! Media session controller.
//!
//! One [`MediaSession`] owns one peer connection plus the local capture that
//! feeds it. The call orchestrator creates a fresh session per call attempt
//! through a [`MediaSessionFactory`] and never runs two at once.

pub mod capture;
pub mod error;
pub mod stats;
pub mod webrtc;

use async_trait::async_trait;
use ranchat_core::ice::IcePathInfo;
use ranchat_core::protocol::{IceCandidate, SessionDescription};
use ranchat_core::types::ConnectivityState;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use capture::{
    CaptureConstraints, CaptureProfile, LocalStream, LocalTrack, MediaDevices, PermissionGrants,
    SyntheticDevices,
};
pub use error::{CaptureError, MediaError};
pub use webrtc::{WebRtcMediaSession, WebRtcMediaSessionFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Notifications from a media session, forwarded to the orchestrator as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalStreamReady,
    RemoteTrack { kind: TrackKind, track_id: String },
    /// A local ICE candidate to trickle to the peer.
    IceCandidate(IceCandidate),
    ConnectionState(ConnectivityState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: String,
    /// Also offer TURN over TCP for networks that block UDP.
    pub use_tcp: bool,
}

impl TurnServer {
    pub fn urls(&self) -> Vec<String> {
        let mut urls = vec![format!("turn:{}:{}?transport=udp", self.host, self.port)];
        if self.use_tcp {
            urls.push(format!("turn:{}:{}?transport=tcp", self.host, self.port));
        }
        urls
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServers {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
}

/// Per-sender encoding ceilings. Also written into the SDP as `b=AS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingLimits {
    pub video_max_kbps: u32,
    pub video_max_framerate: u32,
    pub audio_max_kbps: u32,
}

impl Default for EncodingLimits {
    fn default() -> Self {
        Self {
            video_max_kbps: 900,
            video_max_framerate: 24,
            audio_max_kbps: 48,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub ice_servers: IceServers,
    pub ice_candidate_pool_size: u8,
    pub preferred_video_codec: Option<String>,
    pub limits: EncodingLimits,
    pub preferred_capture: CaptureProfile,
    pub fallback_capture: CaptureProfile,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServers::default(),
            ice_candidate_pool_size: 2,
            preferred_video_codec: Some("H264".to_string()),
            limits: EncodingLimits::default(),
            preferred_capture: CaptureProfile::new(640, 960, 30),
            fallback_capture: CaptureProfile::new(320, 480, 15),
        }
    }
}

impl MediaConfig {
    pub fn sdp_shaping(&self) -> ranchat_core::sdp::SdpShaping {
        ranchat_core::sdp::SdpShaping {
            preferred_video_codec: self.preferred_video_codec.clone(),
            audio_max_kbps: Some(self.limits.audio_max_kbps),
            video_max_kbps: Some(self.limits.video_max_kbps),
        }
    }
}

/// One peer connection and its local capture.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Acquires local media, attaches it and, when `is_caller`, returns the offer.
    async fn start(&self, is_caller: bool) -> Result<Option<SessionDescription>, MediaError>;

    async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    async fn handle_remote_answer(&self, answer: SessionDescription) -> Result<(), MediaError>;

    /// Failures are logged and swallowed.
    async fn handle_remote_ice(&self, candidate: IceCandidate);

    fn set_local_video_enabled(&self, enabled: bool);

    fn set_local_audio_enabled(&self, enabled: bool);

    async fn ice_path_info(&self) -> Option<IcePathInfo>;

    /// Stops capture and closes the peer connection. Idempotent.
    async fn stop(&self);
}

#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_urls_cover_udp_and_optional_tcp() {
        let mut turn = TurnServer {
            host: "turn.example".into(),
            port: 3478,
            username: "u".into(),
            credential: "p".into(),
            use_tcp: false,
        };
        assert_eq!(turn.urls(), vec!["turn:turn.example:3478?transport=udp"]);
        turn.use_tcp = true;
        assert_eq!(turn.urls().len(), 2);
        assert!(turn.urls()[1].ends_with("transport=tcp"));
    }
}
