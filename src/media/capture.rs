//! Local capture: permission checks, constraint fallback and the tracks that
//! feed the peer connection.

use super::error::{CaptureError, MediaError};
use super::{EncodingLimits, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "ranchat-local";
const OPUS_FRAME: Duration = Duration::from_millis(20);
/// A single Opus silence frame (TOC byte plus padding).
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CaptureProfile {
    pub const fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }

    fn fits_within(&self, max: &CaptureProfile) -> bool {
        self.width <= max.width && self.height <= max.height && self.frame_rate <= max.frame_rate
    }
}

impl fmt::Display for CaptureProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.frame_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: CaptureProfile,
    /// MIME type the video track is declared with, e.g. `video/H264`.
    pub video_mime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGrants {
    pub camera: bool,
    pub microphone: bool,
}

impl PermissionGrants {
    pub const ALL: Self = Self {
        camera: true,
        microphone: true,
    };

    pub fn all_granted(&self) -> bool {
        self.camera && self.microphone
    }
}

/// One captured track. Disabling it keeps the sender attached but stops
/// frames from flowing.
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct LocalStream {
    pub tracks: Vec<LocalTrack>,
    pub profile: Option<CaptureProfile>,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>, profile: CaptureProfile) -> Self {
        Self {
            tracks,
            profile: Some(profile),
            pumps: Vec::new(),
        }
    }

    /// Registers a frame producer that is aborted by [`LocalStream::stop`].
    pub fn attach_pump(&mut self, pump: JoinHandle<()>) {
        self.pumps.push(pump);
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.tracks.clear();
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Platform camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request_permissions(&self) -> PermissionGrants;

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CaptureError>;
}

pub fn video_mime_for(codec: Option<&str>) -> String {
    match codec.map(|c| c.to_ascii_uppercase()).as_deref() {
        Some("VP8") => MIME_TYPE_VP8.to_string(),
        Some("VP9") => MIME_TYPE_VP9.to_string(),
        _ => MIME_TYPE_H264.to_string(),
    }
}

/// Checks permissions, then opens capture with the preferred profile and
/// retries once with the fallback profile.
pub async fn acquire_local_stream(
    devices: &dyn MediaDevices,
    preferred: CaptureProfile,
    fallback: CaptureProfile,
    limits: &EncodingLimits,
    video_mime: &str,
) -> Result<LocalStream, MediaError> {
    let grants = devices.request_permissions().await;
    if !grants.all_granted() {
        warn!(target: "Media", "Permissions missing: {grants:?}");
        return Err(MediaError::PermissionDenied {
            camera: grants.camera,
            microphone: grants.microphone,
        });
    }

    let cap = |profile: CaptureProfile| CaptureConstraints {
        video: CaptureProfile {
            frame_rate: profile.frame_rate.min(limits.video_max_framerate),
            ..profile
        },
        video_mime: video_mime.to_string(),
    };

    match devices.open(&cap(preferred)).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            warn!(target: "Media", "Preferred capture {preferred} failed ({e}), trying {fallback}");
            let stream = devices.open(&cap(fallback)).await?;
            Ok(stream)
        }
    }
}

/// Devices without real hardware behind them: audio is Opus silence and the
/// video track is declared but carries no frames.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    grants: PermissionGrants,
    max_profile: Option<CaptureProfile>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new(PermissionGrants::ALL)
    }
}

impl SyntheticDevices {
    pub fn new(grants: PermissionGrants) -> Self {
        Self {
            grants,
            max_profile: None,
        }
    }

    /// Rejects any capture request above `max`.
    pub fn with_max_profile(mut self, max: CaptureProfile) -> Self {
        self.max_profile = Some(max);
        self
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn request_permissions(&self) -> PermissionGrants {
        self.grants
    }

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CaptureError> {
        if let Some(max) = &self.max_profile
            && !constraints.video.fits_within(max)
        {
            return Err(CaptureError::Unsupported(constraints.video));
        }

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: constraints.video_mime.clone(),
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));

        let audio = LocalTrack::new(TrackKind::Audio, audio);
        let video = LocalTrack::new(TrackKind::Video, video);
        let pump = tokio::spawn(silence_pump(audio.track.clone(), audio.enabled_flag()));

        info!(target: "Media", "Opened synthetic capture at {}", constraints.video);
        let mut stream = LocalStream::new(vec![audio, video], constraints.video);
        stream.attach_pump(pump);
        Ok(stream)
    }
}

async fn silence_pump(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(OPUS_FRAME);
    loop {
        ticker.tick().await;
        if !enabled.load(Ordering::SeqCst) {
            continue;
        }
        let sample = Sample {
            data: Bytes::from_static(&OPUS_SILENCE),
            duration: OPUS_FRAME,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(target: "Media", "Silence pump stopped: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFERRED: CaptureProfile = CaptureProfile::new(640, 960, 30);
    const FALLBACK: CaptureProfile = CaptureProfile::new(320, 480, 15);

    async fn acquire(devices: &SyntheticDevices) -> Result<LocalStream, MediaError> {
        acquire_local_stream(
            devices,
            PREFERRED,
            FALLBACK,
            &EncodingLimits::default(),
            MIME_TYPE_H264,
        )
        .await
    }

    #[tokio::test]
    async fn preferred_profile_is_capped_to_encoder_framerate() {
        let stream = acquire(&SyntheticDevices::default()).await.unwrap();
        assert_eq!(stream.profile, Some(CaptureProfile::new(640, 960, 24)));
        assert!(stream.track(TrackKind::Audio).is_some());
        assert!(stream.track(TrackKind::Video).is_some());
    }

    #[tokio::test]
    async fn falls_back_when_preferred_profile_is_rejected() {
        let devices =
            SyntheticDevices::default().with_max_profile(CaptureProfile::new(320, 480, 15));
        let stream = acquire(&devices).await.unwrap();
        assert_eq!(stream.profile, Some(FALLBACK));
    }

    #[tokio::test]
    async fn fails_when_both_profiles_are_rejected() {
        let devices = SyntheticDevices::default().with_max_profile(CaptureProfile::new(160, 120, 10));
        let err = acquire(&devices).await.unwrap_err();
        assert!(matches!(
            err,
            MediaError::Acquisition(CaptureError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn missing_permission_is_reported_before_capture() {
        let devices = SyntheticDevices::new(PermissionGrants {
            camera: true,
            microphone: false,
        });
        let err = acquire(&devices).await.unwrap_err();
        assert!(matches!(
            err,
            MediaError::PermissionDenied {
                camera: true,
                microphone: false
            }
        ));
    }

    #[tokio::test]
    async fn toggling_a_kind_only_touches_its_tracks() {
        let stream = acquire(&SyntheticDevices::default()).await.unwrap();
        stream.set_enabled(TrackKind::Video, false);
        assert!(!stream.track(TrackKind::Video).unwrap().is_enabled());
        assert!(stream.track(TrackKind::Audio).unwrap().is_enabled());
    }

    #[test]
    fn video_mime_defaults_to_h264() {
        assert_eq!(video_mime_for(Some("vp8")), MIME_TYPE_VP8);
        assert_eq!(video_mime_for(None), MIME_TYPE_H264);
        assert_eq!(video_mime_for(Some("AV1")), MIME_TYPE_H264);
    }
}
