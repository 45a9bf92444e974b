use super::timers::{TimerKind, Timers};
use super::{CallConfig, CallDependencies, CallError, validate_filters};
use crate::auth::{AuthError, AuthSession};
use crate::media::{MediaError, MediaEvent, MediaSession};
use crate::signal::{Credentials, SignalClient, SignalEvent};
use crate::types::events::{Event, EventBus};
use log::{debug, info, warn};
use ranchat_core::generation::{Generation, Token};
use ranchat_core::ice::IcePathInfo;
use ranchat_core::protocol::{IceCandidate, RelayPayload, SdpKind, SessionDescription};
use ranchat_core::types::{ConnectivityState, EndCause, Phase, Role};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug)]
enum Command {
    Start,
    FindOther,
    Retry,
    Stop,
    Exit,
    SetCamera(bool),
    SetMicrophone(bool),
    PurchaseCompleted,
}

/// Remote negotiation steps, applied in arrival order by one worker per
/// media session.
#[derive(Debug)]
enum NegotiationOp {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
}

/// Completions posted back to the actor. Each carries the token it was
/// started under and is dropped if that token is no longer current.
pub(crate) enum Input {
    Bound {
        queue_token: Token,
        result: Result<AuthSession, AuthError>,
    },
    Signal {
        queue_token: Token,
        event: SignalEvent,
    },
    MediaCreated {
        call_token: Token,
        is_caller: bool,
        result: Result<Arc<dyn MediaSession>, MediaError>,
    },
    MediaStarted {
        call_token: Token,
        result: Result<(), MediaError>,
    },
    Media {
        call_token: Token,
        event: MediaEvent,
    },
    LocalDescription {
        call_token: Token,
        description: SessionDescription,
    },
    NegotiationFailed {
        call_token: Token,
        error: MediaError,
    },
    IcePath {
        call_token: Token,
        info: Option<IcePathInfo>,
    },
    Timer {
        kind: TimerKind,
        token: Token,
        seq: u64,
    },
    InterstitialDone {
        ad_token: Token,
    },
    EntitlementsRefreshed {
        premium: bool,
    },
}

/// Handle to a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
}

impl CallHandle {
    /// Starts a queue cycle, tearing down whatever was running.
    pub fn start(&self) -> Result<(), CallError> {
        self.send(Command::Start)
    }

    /// Skips the current partner. Non-entitled users may see an interstitial first.
    pub fn find_other(&self) -> Result<(), CallError> {
        self.send(Command::FindOther)
    }

    /// Answers the no-match prompt with "try again".
    pub fn retry(&self) -> Result<(), CallError> {
        self.send(Command::Retry)
    }

    pub fn stop(&self) -> Result<(), CallError> {
        self.send(Command::Stop)
    }

    /// Tears everything down and ends the orchestrator.
    pub fn exit(&self) -> Result<(), CallError> {
        self.send(Command::Exit)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetCamera(enabled))
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetMicrophone(enabled))
    }

    /// Re-reads entitlements after a purchase.
    pub fn purchase_completed(&self) -> Result<(), CallError> {
        self.send(Command::PurchaseCompleted)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| CallError::Shutdown)
    }
}

struct Room {
    id: String,
    role: Role,
}

/// State scoped to one queue cycle. Reset on every new cycle and on teardown.
#[derive(Default)]
struct Cycle {
    nonce: String,
    awaiting_peer: bool,
    call_started: bool,
    buffered: Vec<NegotiationOp>,
    media_connected: bool,
    limiter_fired: bool,
    remote_video_blocked: bool,
    hint_shown: bool,
    hint_visible: bool,
    prompt_shown: bool,
    unstable: bool,
}

pub struct CallOrchestrator {
    config: CallConfig,
    deps: CallDependencies,
    events: EventBus,
    command_rx: mpsc::UnboundedReceiver<Command>,
    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox_rx: mpsc::UnboundedReceiver<Input>,
    phase_tx: watch::Sender<Phase>,
    timers: Timers,

    queue_gen: Generation,
    call_gen: Generation,
    down_gen: Generation,
    ad_gen: Generation,

    signal: Option<SignalClient>,
    media: Option<Arc<dyn MediaSession>>,
    negotiation: Option<mpsc::UnboundedSender<NegotiationOp>>,
    room: Option<Room>,
    cycle: Cycle,
    /// Last queue token that went through end-and-requeue.
    ended_for: Option<Token>,
    /// True while nothing is running; makes teardown idempotent.
    stopped: bool,
    camera_enabled: bool,
    microphone_enabled: bool,
    exit: bool,
}

impl CallOrchestrator {
    /// Builds the actor and its handle. The phase reads `Ended` until
    /// [`CallHandle::start`].
    pub fn new(config: CallConfig, deps: CallDependencies, events: EventBus) -> (Self, CallHandle) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(Phase::Ended);

        let orchestrator = Self {
            config,
            deps,
            events,
            command_rx,
            timers: Timers::new(inbox_tx.clone()),
            inbox_tx,
            inbox_rx,
            phase_tx,
            queue_gen: Generation::new(),
            call_gen: Generation::new(),
            down_gen: Generation::new(),
            ad_gen: Generation::new(),
            signal: None,
            media: None,
            negotiation: None,
            room: None,
            cycle: Cycle::default(),
            ended_for: None,
            stopped: true,
            camera_enabled: true,
            microphone_enabled: true,
            exit: false,
        };
        (orchestrator, CallHandle { commands, phase })
    }

    /// Builds the actor and runs it on the current runtime.
    pub fn spawn(config: CallConfig, deps: CallDependencies, events: EventBus) -> CallHandle {
        let (orchestrator, handle) = Self::new(config, deps, events);
        tokio::spawn(orchestrator.run());
        handle
    }

    pub async fn run(mut self) {
        info!(target: "Call", "Call orchestrator running");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop_all(false).await;
                        break;
                    }
                },
                Some(input) = self.inbox_rx.recv() => self.handle_input(input).await,
            }
            if self.exit {
                break;
            }
        }
        info!(target: "Call", "Call orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(target: "Call", "Command: {command:?}");
        match command {
            Command::Start => {
                self.stop_all(false).await;
                self.start_queue();
            }
            Command::FindOther => self.find_other().await,
            Command::Retry => {
                if self.cycle.prompt_shown {
                    self.cycle.prompt_shown = false;
                    self.start_queue();
                } else {
                    debug!(target: "Call", "Retry without a pending prompt ignored");
                }
            }
            Command::Stop => self.stop_all(false).await,
            Command::Exit => {
                self.stop_all(false).await;
                self.emit(Event::Exited);
                self.exit = true;
            }
            Command::SetCamera(enabled) => {
                self.camera_enabled = enabled;
                if let Some(media) = &self.media {
                    media.set_local_video_enabled(enabled);
                }
                if self.phase() == Phase::Calling {
                    self.relay_to_room(RelayPayload::CameraState { enabled });
                }
            }
            Command::SetMicrophone(enabled) => {
                self.microphone_enabled = enabled;
                if let Some(media) = &self.media {
                    media.set_local_audio_enabled(enabled);
                }
            }
            Command::PurchaseCompleted => {
                let entitlements = self.deps.entitlements.clone();
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    let premium = entitlements.refresh().await;
                    let _ = inbox.send(Input::EntitlementsRefreshed { premium });
                });
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Bound {
                queue_token,
                result,
            } => {
                if self.queue_gen.is_current(queue_token) {
                    self.on_bound(queue_token, result).await;
                }
            }
            Input::Signal { queue_token, event } => {
                if self.queue_gen.is_current(queue_token) {
                    self.on_signal(event).await;
                } else {
                    debug!(target: "Call", "Dropping {event:?} from queue cycle {queue_token}");
                }
            }
            Input::MediaCreated {
                call_token,
                is_caller,
                result,
            } => self.on_media_created(call_token, is_caller, result).await,
            Input::MediaStarted { call_token, result } => {
                if self.call_gen.is_current(call_token) {
                    self.on_media_started(call_token, result).await;
                }
            }
            Input::Media { call_token, event } => {
                if self.call_gen.is_current(call_token) {
                    self.on_media_event(call_token, event);
                }
            }
            Input::LocalDescription {
                call_token,
                description,
            } => {
                if self.call_gen.is_current(call_token) {
                    let payload = match description.kind {
                        SdpKind::Offer => RelayPayload::Offer(description),
                        SdpKind::Answer => RelayPayload::Answer(description),
                    };
                    self.relay_to_room(payload);
                }
            }
            Input::NegotiationFailed { call_token, error } => {
                if self.call_gen.is_current(call_token) {
                    self.fail_call(error).await;
                }
            }
            Input::IcePath { call_token, info } => {
                if let Some(info) = info.filter(|_| self.call_gen.is_current(call_token)) {
                    info!(
                        target: "Call",
                        "Media path {} -> {} over {}{}",
                        info.local_candidate_type,
                        info.remote_candidate_type,
                        info.protocol,
                        if info.is_relayed() { " (relayed)" } else { "" }
                    );
                    self.emit(Event::IcePath(info));
                }
            }
            Input::Timer { kind, token, seq } => self.on_timer(kind, token, seq).await,
            Input::InterstitialDone { ad_token } => {
                if self.ad_gen.is_current(ad_token) {
                    self.end_and_requeue(EndCause::FindOther).await;
                }
            }
            Input::EntitlementsRefreshed { premium } => {
                if premium {
                    self.timers.cancel(TimerKind::FreeLimit);
                    if std::mem::take(&mut self.cycle.remote_video_blocked) {
                        info!(target: "Call", "Premium unlocked, remote video restored");
                        self.emit(Event::RemoteVideoAllowed(true));
                    }
                }
            }
        }
    }

    fn start_queue(&mut self) {
        if let Err(e) = validate_filters(&self.config.filters) {
            warn!(target: "Call", "Refusing to queue: {e}");
            self.emit(Event::CallError(e.to_string()));
            self.emit(Event::Exited);
            self.exit = true;
            return;
        }

        self.stopped = false;
        let token = self.queue_gen.bump();
        self.cycle = Cycle {
            nonce: hex::encode(rand::random::<[u8; 8]>()),
            ..Default::default()
        };
        info!(target: "Call", "Starting queue cycle {token}");
        self.set_phase(Phase::Connecting);
        self.timers
            .arm(TimerKind::NoMatch, self.config.no_match_timeout, token);

        let sessions = self.deps.sessions.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = sessions.session().await;
            let _ = inbox.send(Input::Bound {
                queue_token: token,
                result,
            });
        });
    }

    async fn on_bound(&mut self, token: Token, result: Result<AuthSession, AuthError>) {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!(target: "Call", "Device binding failed: {e}");
                self.auth_failed(e.to_string()).await;
                return;
            }
        };

        if let Some(old) = self.signal.take() {
            old.close();
        }
        let (client, mut signal_events) =
            SignalClient::spawn(self.deps.transport_factory.clone(), self.config.signal.clone());
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = signal_events.recv().await {
                if inbox
                    .send(Input::Signal {
                        queue_token: token,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        let credentials = Credentials::new(session.token, session.device_key);
        if let Err(e) = client.connect(self.config.signaling_url.clone(), credentials) {
            client.close();
            self.auth_failed(e.to_string()).await;
            return;
        }
        if client.enqueue(self.config.filters.clone()).is_err() {
            debug!(target: "Call", "Signaling client gone before enqueue");
        }
        self.signal = Some(client);
    }

    async fn auth_failed(&mut self, reason: String) {
        self.emit(Event::AuthFailed(reason));
        self.stop_all(false).await;
        self.emit(Event::Exited);
        self.exit = true;
    }

    async fn on_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Connected => {
                if std::mem::take(&mut self.cycle.unstable) {
                    info!(target: "Call", "Signaling restored");
                    self.emit(Event::NetworkUnstable(false));
                }
                if self.room.is_some() {
                    self.relay_to_room(RelayPayload::PeerMetadata(
                        self.config.profile.metadata(&self.cycle.nonce),
                    ));
                    if self.phase() == Phase::Calling {
                        self.relay_to_room(RelayPayload::CameraState {
                            enabled: self.camera_enabled,
                        });
                    }
                }
            }
            SignalEvent::Disconnected => {
                if self.phase() == Phase::Calling && !self.cycle.unstable {
                    warn!(target: "Call", "Signaling lost mid-call, waiting for reconnect");
                    self.cycle.unstable = true;
                    self.emit(Event::NetworkUnstable(true));
                }
            }
            SignalEvent::Queued => {
                if self.room.is_none() {
                    self.set_phase(Phase::Queued);
                    self.timers.arm(
                        TimerKind::NoMatch,
                        self.config.no_match_timeout,
                        self.queue_gen.current(),
                    );
                }
            }
            SignalEvent::Matched { room_id, role } => self.on_matched(room_id, role),
            SignalEvent::Relay { room_id, payload } => self.on_relay(room_id, payload).await,
            SignalEvent::End => {
                if self.room.is_some() {
                    info!(target: "Call", "Peer left");
                    self.end_and_requeue(EndCause::RemoteLeft).await;
                } else {
                    debug!(target: "Call", "End outside a room ignored");
                }
            }
            SignalEvent::ServerError(reason) => self.emit(Event::ServerError(reason)),
            SignalEvent::ProtocolError(reason) => self.emit(Event::ProtocolError(reason)),
        }
    }

    fn on_matched(&mut self, room_id: String, role: Role) {
        if self.room.is_some() || self.phase() == Phase::Calling {
            debug!(target: "Call", "Ignoring match {room_id}: already in a room");
            return;
        }
        info!(target: "Call", "Matched in {room_id} as {role:?}");
        self.timers.cancel(TimerKind::NoMatch);
        self.timers.cancel(TimerKind::FastMatchHint);
        self.dismiss_hint();

        self.room = Some(Room {
            id: room_id.clone(),
            role,
        });
        self.set_phase(Phase::Matched);
        self.emit(Event::Matched { room_id, role });

        self.relay_to_room(RelayPayload::PeerMetadata(
            self.config.profile.metadata(&self.cycle.nonce),
        ));
        self.cycle.awaiting_peer = true;
        self.timers.arm(
            TimerKind::PeerReady,
            self.config.peer_ready_timeout,
            self.queue_gen.current(),
        );
    }

    async fn on_relay(&mut self, room_id: String, payload: RelayPayload) {
        match &self.room {
            Some(room) if room.id == room_id => {}
            _ => {
                debug!(target: "Call", "Dropping '{}' relay for room {room_id}", payload.kind());
                return;
            }
        }

        match payload {
            RelayPayload::PeerMetadata(metadata) => {
                if !metadata.nonce.is_empty() && metadata.nonce == self.cycle.nonce {
                    debug!(target: "Call", "Ignoring our own metadata echo");
                    return;
                }
                self.emit(Event::PeerInfo(metadata));
                if std::mem::take(&mut self.cycle.awaiting_peer) {
                    self.timers.cancel(TimerKind::PeerReady);
                    self.begin_call();
                }
            }
            RelayPayload::Offer(offer) => self.negotiate(NegotiationOp::Offer(offer)),
            RelayPayload::Answer(answer) => self.negotiate(NegotiationOp::Answer(answer)),
            RelayPayload::Ice(candidate) => self.negotiate(NegotiationOp::Ice(candidate)),
            RelayPayload::CameraState { enabled } => self.emit(Event::RemoteCamera { enabled }),
            RelayPayload::End => self.end_and_requeue(EndCause::RemoteLeft).await,
            RelayPayload::Other(data) => debug!(target: "Call", "Unhandled relay: {data}"),
        }
    }

    fn negotiate(&mut self, op: NegotiationOp) {
        match &self.negotiation {
            Some(worker) => {
                if worker.send(op).is_err() {
                    debug!(target: "Call", "Negotiation worker gone");
                }
            }
            None => self.cycle.buffered.push(op),
        }
    }

    fn begin_call(&mut self) {
        let Some(room) = &self.room else {
            return;
        };
        if std::mem::replace(&mut self.cycle.call_started, true) {
            return;
        }
        let is_caller = room.role.is_caller();
        let call_token = self.call_gen.bump();
        info!(target: "Call", "Starting media (caller: {is_caller})");

        let (media_tx, mut media_rx) = mpsc::unbounded_channel();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = media_rx.recv().await {
                if inbox.send(Input::Media { call_token, event }).is_err() {
                    break;
                }
            }
        });

        let factory = self.deps.media_factory.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = factory.create(media_tx).await;
            let _ = inbox.send(Input::MediaCreated {
                call_token,
                is_caller,
                result,
            });
        });
    }

    async fn on_media_created(
        &mut self,
        call_token: Token,
        is_caller: bool,
        result: Result<Arc<dyn MediaSession>, MediaError>,
    ) {
        if !self.call_gen.is_current(call_token) {
            if let Ok(session) = result {
                debug!(target: "Call", "Stopping media session from a superseded call");
                session.stop().await;
            }
            return;
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.fail_call(e).await;
                return;
            }
        };
        if let Some(old) = self.media.take() {
            old.stop().await;
        }
        session.set_local_video_enabled(self.camera_enabled);
        session.set_local_audio_enabled(self.microphone_enabled);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        for op in self.cycle.buffered.drain(..) {
            let _ = ops_tx.send(op);
        }
        tokio::spawn(negotiation_worker(
            session.clone(),
            is_caller,
            call_token,
            ops_rx,
            self.inbox_tx.clone(),
        ));
        self.media = Some(session);
        self.negotiation = Some(ops_tx);
    }

    async fn on_media_started(&mut self, call_token: Token, result: Result<(), MediaError>) {
        if let Err(e) = result {
            self.fail_call(e).await;
            return;
        }
        info!(target: "Call", "Media started");
        self.set_phase(Phase::Calling);
        self.relay_to_room(RelayPayload::CameraState {
            enabled: self.camera_enabled,
        });
        self.timers.arm(
            TimerKind::MediaWatchdog,
            self.config.media_connect_timeout,
            call_token,
        );
        if !self.deps.entitlements.is_premium() && !self.cycle.limiter_fired {
            self.timers
                .arm(TimerKind::FreeLimit, self.config.free_call_limit, call_token);
        }
        self.emit(Event::RemoteVideoAllowed(true));
    }

    fn on_media_event(&mut self, call_token: Token, event: MediaEvent) {
        match event {
            MediaEvent::LocalStreamReady => self.emit(Event::LocalStreamReady),
            MediaEvent::RemoteTrack { kind, .. } => self.emit(Event::RemoteStreamReady { kind }),
            MediaEvent::IceCandidate(candidate) => {
                self.relay_to_room(RelayPayload::Ice(candidate));
            }
            MediaEvent::ConnectionState(ConnectivityState::Connected) => {
                self.timers.cancel(TimerKind::MediaWatchdog);
                self.timers.cancel(TimerKind::ConnectivityDebounce);
                self.down_gen.bump();
                if std::mem::replace(&mut self.cycle.media_connected, true) {
                    info!(target: "Call", "Media connectivity recovered");
                    return;
                }
                info!(target: "Call", "Media connected");
                self.emit(Event::MediaConnected);
                if let Some(media) = self.media.clone() {
                    let inbox = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        let info = media.ice_path_info().await;
                        let _ = inbox.send(Input::IcePath { call_token, info });
                    });
                }
            }
            MediaEvent::ConnectionState(state)
                if state.is_down() && self.phase() == Phase::Calling =>
            {
                warn!(target: "Call", "Media connectivity {state:?}, waiting for recovery");
                let token = self.down_gen.bump();
                self.timers.arm(
                    TimerKind::ConnectivityDebounce,
                    self.config.connectivity_debounce,
                    token,
                );
            }
            MediaEvent::ConnectionState(state) => {
                debug!(target: "Call", "Media connectivity {state:?}");
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind, token: Token, seq: u64) {
        if !self.timers.fired(kind, seq) {
            return;
        }
        let generation = match kind {
            TimerKind::NoMatch
            | TimerKind::FastMatchHint
            | TimerKind::PeerReady
            | TimerKind::Requeue => &self.queue_gen,
            TimerKind::MediaWatchdog | TimerKind::FreeLimit => &self.call_gen,
            TimerKind::ConnectivityDebounce => &self.down_gen,
        };
        if !generation.is_current(token) {
            debug!(target: "Call/Timer", "Stale {kind:?} timer ignored");
            return;
        }
        debug!(target: "Call/Timer", "{kind:?} fired");

        match kind {
            TimerKind::NoMatch => self.on_no_match(token).await,
            TimerKind::FastMatchHint => self.dismiss_hint(),
            TimerKind::PeerReady => {
                if self.cycle.awaiting_peer {
                    warn!(target: "Call", "Peer never introduced itself");
                    self.end_and_requeue(EndCause::Disconnect).await;
                }
            }
            TimerKind::MediaWatchdog => {
                if !self.cycle.media_connected && self.phase() == Phase::Calling {
                    warn!(target: "Call", "Media did not connect in time");
                    self.end_and_requeue(EndCause::Disconnect).await;
                }
            }
            TimerKind::ConnectivityDebounce => {
                if self.phase() == Phase::Calling {
                    warn!(target: "Call", "Media connectivity lost");
                    self.end_and_requeue(EndCause::RemoteLeft).await;
                }
            }
            TimerKind::FreeLimit => {
                if !self.cycle.limiter_fired && !self.deps.entitlements.is_premium() {
                    info!(target: "Call", "Free call limit reached");
                    self.cycle.limiter_fired = true;
                    self.cycle.remote_video_blocked = true;
                    self.emit(Event::RemoteVideoAllowed(false));
                    self.emit(Event::FreeLimitReached);
                }
            }
            TimerKind::Requeue => self.start_queue(),
        }
    }

    async fn on_no_match(&mut self, token: Token) {
        if self.room.is_some() {
            return;
        }
        if self.deps.entitlements.is_premium() {
            if self.cycle.hint_shown {
                return;
            }
            self.cycle.hint_shown = true;
            self.cycle.hint_visible = true;
            self.emit(Event::FastMatchHint(true));
            self.timers.arm(
                TimerKind::FastMatchHint,
                self.config.fast_match_hint_duration,
                token,
            );
        } else {
            info!(target: "Call", "No match in time");
            self.stop_all(false).await;
            self.cycle.prompt_shown = true;
            self.emit(Event::NoMatchPrompt);
        }
    }

    async fn find_other(&mut self) {
        if self.room.is_none() {
            debug!(target: "Call", "Find-other outside a room ignored");
            return;
        }
        if self.deps.entitlements.is_premium() {
            self.end_and_requeue(EndCause::FindOther).await;
            return;
        }
        let ad_token = self.ad_gen.bump();
        let gate = self.deps.interstitials.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            gate.maybe_show_interstitial().await;
            let _ = inbox.send(Input::InterstitialDone { ad_token });
        });
    }

    async fn fail_call(&mut self, error: MediaError) {
        warn!(target: "Call", "Call failed: {error}");
        self.emit(Event::CallError(error.to_string()));
        self.end_and_requeue(EndCause::Error).await;
    }

    /// Ends whatever runs under the current queue token and starts over. Runs
    /// at most once per queue token.
    async fn end_and_requeue(&mut self, cause: EndCause) {
        let token = self.queue_gen.current();
        if self.ended_for == Some(token) {
            debug!(target: "Call", "Already ended cycle {token}, ignoring {cause}");
            return;
        }
        self.ended_for = Some(token);
        info!(target: "Call", "Ending call: {cause}");

        self.stop_all(cause.suppresses_end_relay()).await;
        self.emit(Event::CallEnded { cause });

        match cause {
            EndCause::RemoteLeft => self.timers.arm(
                TimerKind::Requeue,
                self.config.remote_left_requeue_delay,
                self.queue_gen.current(),
            ),
            _ => self.start_queue(),
        }
    }

    /// Teardown from any phase. Tokens and timers are always invalidated;
    /// resources are released only once.
    async fn stop_all(&mut self, suppress_end: bool) {
        self.queue_gen.bump();
        self.call_gen.bump();
        self.down_gen.bump();
        self.ad_gen.bump();
        self.timers.cancel_all();

        if std::mem::replace(&mut self.stopped, true) {
            debug!(target: "Call", "Teardown already done");
            return;
        }
        info!(target: "Call", "Tearing down");

        let room = self.room.take();
        if let Some(signal) = self.signal.take() {
            match room {
                Some(room) => {
                    // `end` goes out before `leave`: the server only relays
                    // for rooms we are still in.
                    if !suppress_end {
                        let _ = signal.relay(room.id.clone(), RelayPayload::End);
                    }
                    let _ = signal.leave_room(Some(room.id));
                }
                None => {
                    let _ = signal.leave_queue();
                }
            }
            signal.close();
        }

        self.negotiation = None;
        if let Some(media) = self.media.take() {
            media.stop().await;
        }

        if self.cycle.unstable {
            self.emit(Event::NetworkUnstable(false));
        }
        self.dismiss_hint();
        self.cycle = Cycle::default();
        self.set_phase(Phase::Ended);
    }

    fn dismiss_hint(&mut self) {
        if std::mem::take(&mut self.cycle.hint_visible) {
            self.emit(Event::FastMatchHint(false));
        }
    }

    fn relay_to_room(&self, payload: RelayPayload) {
        let (Some(signal), Some(room)) = (&self.signal, &self.room) else {
            debug!(target: "Call", "No room for '{}' relay", payload.kind());
            return;
        };
        if signal.relay(room.id.clone(), payload).is_err() {
            debug!(target: "Call", "Signaling client gone, relay dropped");
        }
    }

    fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        if self.phase() == phase {
            return;
        }
        info!(target: "Call", "Phase -> {phase}");
        self.phase_tx.send_replace(phase);
        self.emit(Event::PhaseChanged(phase));
    }

    fn emit(&self, event: Event) {
        self.events.dispatch(&event);
    }
}

async fn negotiation_worker(
    session: Arc<dyn MediaSession>,
    is_caller: bool,
    call_token: Token,
    mut ops: mpsc::UnboundedReceiver<NegotiationOp>,
    inbox: mpsc::UnboundedSender<Input>,
) {
    match session.start(is_caller).await {
        Ok(offer) => {
            let _ = inbox.send(Input::MediaStarted {
                call_token,
                result: Ok(()),
            });
            if let Some(description) = offer {
                let _ = inbox.send(Input::LocalDescription {
                    call_token,
                    description,
                });
            }
        }
        Err(error) => {
            let _ = inbox.send(Input::MediaStarted {
                call_token,
                result: Err(error),
            });
            return;
        }
    }

    while let Some(op) = ops.recv().await {
        let outcome = match op {
            NegotiationOp::Offer(offer) => session.handle_remote_offer(offer).await.map(Some),
            NegotiationOp::Answer(answer) => session.handle_remote_answer(answer).await.map(|_| None),
            NegotiationOp::Ice(candidate) => {
                session.handle_remote_ice(candidate).await;
                Ok(None)
            }
        };
        match outcome {
            Ok(Some(description)) => {
                let _ = inbox.send(Input::LocalDescription {
                    call_token,
                    description,
                });
            }
            Ok(None) => {}
            Err(MediaError::Stopped) => break,
            Err(error) => {
                let _ = inbox.send(Input::NegotiationFailed { call_token, error });
                break;
            }
        }
    }
    debug!(target: "Call", "Negotiation worker for call {call_token} finished");
}
