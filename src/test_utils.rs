//! Doubles for the orchestrator's collaborators, shared by unit and
//! integration tests.

use crate::auth::{AuthError, AuthSession, BindError, SessionProvider};
use crate::media::{MediaError, MediaEvent, MediaSession, MediaSessionFactory};
use crate::services::ads::InterstitialGate;
use crate::services::entitlements::Entitlements;
use crate::types::events::{Event, EventHandler};
use async_trait::async_trait;
use ranchat_core::ice::IcePathInfo;
use ranchat_core::net::{HttpClient, HttpRequest, HttpResponse};
use ranchat_core::protocol::{IceCandidate, SessionDescription};
use ranchat_core::types::ConnectivityState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lets spawned tasks and channel hops run to quiescence.
pub async fn settle() {
    for _ in 0..256 {
        tokio::task::yield_now().await;
    }
}

/// Canned HTTP responses keyed by URL. Anything unregistered is a 404.
#[derive(Default)]
pub struct MockHttpClient {
    responses: Mutex<HashMap<String, (u16, String)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        lock(&self.responses).insert(url.to_string(), (status, body.to_string()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let (status_code, body) = lock(&self.responses)
            .get(&request.url)
            .cloned()
            .unwrap_or((404, String::new()));
        lock(&self.requests).push(request);
        Ok(HttpResponse {
            status_code,
            body: body.into_bytes(),
        })
    }
}

/// Always hands out the same session, or always fails.
pub struct StaticSession(Option<AuthSession>);

impl StaticSession {
    pub fn new(device_key: &str, token: &str, user_id: &str) -> Self {
        Self(Some(AuthSession {
            device_key: device_key.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
        }))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn session(&self) -> Result<AuthSession, AuthError> {
        self.0.clone().ok_or(AuthError::Bind(BindError::MissingBaseUrl))
    }
}

/// Premium flag flipped by the test. `refresh` returns the current flag.
#[derive(Default)]
pub struct StaticEntitlements(AtomicBool);

impl StaticEntitlements {
    pub fn new(premium: bool) -> Self {
        Self(AtomicBool::new(premium))
    }

    pub fn set_premium(&self, premium: bool) {
        self.0.store(premium, Ordering::SeqCst);
    }
}

#[async_trait]
impl Entitlements for StaticEntitlements {
    fn is_premium(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    async fn refresh(&self) -> bool {
        self.is_premium()
    }
}

/// Resolves at once and counts how often it was asked.
#[derive(Default)]
pub struct ImmediateGate(AtomicUsize);

impl ImmediateGate {
    pub fn calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterstitialGate for ImmediateGate {
    async fn maybe_show_interstitial(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingHandler(Mutex<Vec<Event>>);

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        lock(&self.0).iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) {
        lock(&self.0).push(event.clone());
    }
}

#[derive(Default)]
struct MediaCounters {
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_next_start: AtomicBool,
}

/// Hands out [`MockMediaSession`]s and tracks how many are alive at once.
#[derive(Default)]
pub struct MockMediaFactory {
    counters: Arc<MediaCounters>,
    sessions: Mutex<Vec<Arc<MockMediaSession>>>,
}

impl MockMediaFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next session's `start` fails as if permissions were denied.
    pub fn fail_next_start(&self) {
        self.counters.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<Arc<MockMediaSession>> {
        lock(&self.sessions).last().cloned()
    }
}

#[async_trait]
impl MediaSessionFactory for MockMediaFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        let session = Arc::new(MockMediaSession {
            counters: self.counters.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
        });
        lock(&self.sessions).push(session.clone());
        Ok(session)
    }
}

/// Records every call as a short string such as `start(caller)` or `offer:v=0`.
pub struct MockMediaSession {
    counters: Arc<MediaCounters>,
    events: mpsc::UnboundedSender<MediaEvent>,
    calls: Mutex<Vec<String>>,
    stopped: AtomicBool,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,
}

impl MockMediaSession {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        self.emit(MediaEvent::ConnectionState(state));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn start(&self, is_caller: bool) -> Result<Option<SessionDescription>, MediaError> {
        self.record(format!("start({})", if is_caller { "caller" } else { "callee" }));
        if self.counters.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied {
                camera: true,
                microphone: true,
            });
        }
        self.emit(MediaEvent::LocalStreamReady);
        Ok(is_caller.then(|| SessionDescription::offer("mock-offer")))
    }

    async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.record(format!("offer:{}", offer.sdp));
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn handle_remote_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        self.record(format!("answer:{}", answer.sdp));
        Ok(())
    }

    async fn handle_remote_ice(&self, candidate: IceCandidate) {
        self.record(format!("ice:{}", candidate.candidate));
    }

    fn set_local_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_local_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn ice_path_info(&self) -> Option<IcePathInfo> {
        Some(IcePathInfo {
            local_candidate_type: "relay".into(),
            remote_candidate_type: "srflx".into(),
            protocol: "udp".into(),
            round_trip_time_ms: Some(42.0),
            outgoing_bitrate_kbps: None,
        })
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.record("stop".into());
        }
    }
}
