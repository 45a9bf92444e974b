//! Peer connection backed by webrtc-rs.

use super::capture::{LocalStream, MediaDevices, acquire_local_stream, video_mime_for};
use super::error::MediaError;
use super::stats::snapshot_from_report;
use super::{MediaConfig, MediaEvent, MediaSession, MediaSessionFactory, TrackKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use ranchat_core::ice::{IcePathInfo, describe_ice_path};
use ranchat_core::protocol::{IceCandidate, SdpKind, SessionDescription};
use ranchat_core::sdp::SdpShaping;
use ranchat_core::types::ConnectivityState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds one [`WebRtcMediaSession`] per call attempt.
pub struct WebRtcMediaSessionFactory {
    config: MediaConfig,
    devices: Arc<dyn MediaDevices>,
}

impl WebRtcMediaSessionFactory {
    pub fn new(config: MediaConfig, devices: Arc<dyn MediaDevices>) -> Self {
        Self { config, devices }
    }

    fn create_api() -> Result<webrtc::api::API, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let servers = &self.config.ice_servers;
        let mut ice_servers = Vec::new();
        if !servers.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: servers.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &servers.turn {
            ice_servers.push(RTCIceServer {
                urls: turn.urls(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcMediaSessionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let api = Self::create_api()?;
        let peer_connection = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);
        install_callbacks(&peer_connection, &events);

        Ok(Arc::new(WebRtcMediaSession {
            config: self.config.clone(),
            shaping: self.config.sdp_shaping(),
            devices: Arc::clone(&self.devices),
            peer_connection,
            events,
            local_stream: Mutex::new(None),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }))
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: &mpsc::UnboundedSender<MediaEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(target: "Media", "ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(MediaEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(target: "Media", "Failed to serialize local candidate: {e}"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            info!(target: "Media", "Peer connection state: {state}");
            if let Some(state) = connectivity_from(state) {
                let _ = tx.send(MediaEvent::ConnectionState(state));
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                info!(target: "Media", "Remote {kind:?} track {}", track.id());
                let _ = tx.send(MediaEvent::RemoteTrack {
                    kind,
                    track_id: track.id(),
                });
            })
        },
    ));
}

fn connectivity_from(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

pub struct WebRtcMediaSession {
    config: MediaConfig,
    shaping: SdpShaping,
    devices: Arc<dyn MediaDevices>,
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<MediaEvent>,
    local_stream: Mutex<Option<LocalStream>>,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcMediaSession {
    fn ensure_running(&self) -> Result<(), MediaError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(MediaError::Stopped)
        } else {
            Ok(())
        }
    }

    async fn attach_local_media(&self) -> Result<(), MediaError> {
        let stream = acquire_local_stream(
            self.devices.as_ref(),
            self.config.preferred_capture,
            self.config.fallback_capture,
            &self.config.limits,
            &video_mime_for(self.config.preferred_video_codec.as_deref()),
        )
        .await?;

        for local in &stream.tracks {
            let track = Arc::clone(&local.track) as Arc<dyn TrackLocal + Send + Sync>;
            let sender = self.peer_connection.add_track(track).await?;
            // Drain RTCP so interceptors keep running.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let mut stream = stream;
        {
            let mut slot = self.local_stream.lock().unwrap_or_else(PoisonError::into_inner);
            // stop() may have run while we were acquiring.
            if self.stopped.load(Ordering::SeqCst) {
                stream.stop();
                return Err(MediaError::Stopped);
            }
            stream.set_enabled(TrackKind::Video, self.video_enabled.load(Ordering::SeqCst));
            stream.set_enabled(TrackKind::Audio, self.audio_enabled.load(Ordering::SeqCst));
            *slot = Some(stream);
        }
        let _ = self.events.send(MediaEvent::LocalStreamReady);
        Ok(())
    }

    /// Applies SDP shaping, sets it as the local description and returns it.
    async fn commit_local(
        &self,
        description: RTCSessionDescription,
        kind: SdpKind,
    ) -> Result<SessionDescription, MediaError> {
        let shaped = self.shaping.apply(&description.sdp);
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(shaped.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(shaped.clone())?,
        };
        self.peer_connection.set_local_description(description).await?;
        Ok(SessionDescription { kind, sdp: shaped })
    }

    fn toggle(&self, flag: &AtomicBool, kind: TrackKind, enabled: bool) {
        let stream = self.local_stream.lock().unwrap_or_else(PoisonError::into_inner);
        flag.store(enabled, Ordering::SeqCst);
        if let Some(stream) = stream.as_ref() {
            stream.set_enabled(kind, enabled);
        }
    }
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn start(&self, is_caller: bool) -> Result<Option<SessionDescription>, MediaError> {
        self.ensure_running()?;
        self.attach_local_media().await?;
        if !is_caller {
            return Ok(None);
        }

        let offer = self.peer_connection.create_offer(None).await?;
        let offer = self.commit_local(offer, SdpKind::Offer).await?;
        debug!(target: "Media", "Created local offer ({} bytes)", offer.sdp.len());
        Ok(Some(offer))
    }

    async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.ensure_running()?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.commit_local(answer, SdpKind::Answer).await
    }

    async fn handle_remote_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        self.ensure_running()?;
        let state = self.peer_connection.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            debug!(target: "Media", "Ignoring answer in signaling state {state}");
            return Ok(());
        }
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;
        Ok(())
    }

    async fn handle_remote_ice(&self, candidate: IceCandidate) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
            debug!(target: "Media", "Remote candidate rejected: {e}");
        }
    }

    fn set_local_video_enabled(&self, enabled: bool) {
        self.toggle(&self.video_enabled, TrackKind::Video, enabled);
    }

    fn set_local_audio_enabled(&self, enabled: bool) {
        self.toggle(&self.audio_enabled, TrackKind::Audio, enabled);
    }

    async fn ice_path_info(&self) -> Option<IcePathInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let report = self.peer_connection.get_stats().await;
        describe_ice_path(&snapshot_from_report(&report))
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self
            .local_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut stream) = stream {
            stream.stop();
        }
        if let Err(e) = self.peer_connection.close().await {
            debug!(target: "Media", "Peer connection close error: {e}");
        }
        info!(target: "Media", "Media session stopped");
    }
}
