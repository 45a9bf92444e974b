use super::error::SignalError;
use log::{debug, info, warn};
use rand::Rng;
use ranchat_core::backoff::{RECONNECT_MAX_JITTER, ReconnectBackoff};
use ranchat_core::net::{Transport, TransportEvent, TransportFactory};
use ranchat_core::protocol::{ClientMessage, MatchFilters, RelayPayload, ServerMessage};
use ranchat_core::types::{Membership, Role, SignalStatus};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Outbound messages kept while unregistered.
pub const DEFAULT_PENDING_CAPACITY: usize = 50;

#[derive(Clone, Debug)]
pub struct SignalConfig {
    pub pending_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Token and session id presented in `register`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub session_id: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            session_id: session_id.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.token.trim().is_empty() && !self.session_id.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Notifications emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Registration acknowledged. Emitted after every successful (re)registration.
    Connected,
    /// A live connection dropped unexpectedly; reconnection is already scheduled.
    Disconnected,
    Queued,
    Matched {
        room_id: String,
        role: Role,
    },
    /// Typed relay from the peer. `end`/`leave` relays surface as [`SignalEvent::End`].
    Relay {
        room_id: String,
        payload: RelayPayload,
    },
    /// The peer ended the call or left the room.
    End,
    ServerError(String),
    ProtocolError(String),
}

enum Command {
    Connect {
        endpoint: String,
        credentials: Credentials,
    },
    Enqueue(MatchFilters),
    LeaveQueue,
    Relay {
        room_id: String,
        payload: RelayPayload,
    },
    LeaveRoom {
        room_id: Option<String>,
    },
    Close,
}

type DialResult = Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;

/// Work posted back to the actor by its own tasks, tagged with the
/// connection instance that produced it.
enum Internal {
    Dialed { instance: u64, result: DialResult },
    Transport { instance: u64, event: TransportEvent },
    ReconnectDue { instance: u64 },
}

/// Handle to a running signaling client. Cheap to clone.
#[derive(Clone)]
pub struct SignalClient {
    command_tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SignalStatus>,
    membership: watch::Receiver<Membership>,
}

impl SignalClient {
    /// Starts the client actor. It idles until [`SignalClient::connect`].
    pub fn spawn(
        factory: Arc<dyn TransportFactory>,
        config: SignalConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SignalStatus::Disconnected);
        let (membership_tx, membership) = watch::channel(Membership::Idle);

        let actor = SignalActor {
            factory,
            config,
            command_rx,
            internal_tx,
            internal_rx,
            event_tx,
            status_tx,
            membership_tx,
            instance: 0,
            target: None,
            transport: None,
            link_up: false,
            registered: false,
            manual_close: false,
            pending: VecDeque::new(),
            queue_intent: None,
            backoff: ReconnectBackoff::new(),
            reconnect_timer: None,
        };
        tokio::spawn(actor.run());

        (
            Self {
                command_tx,
                status,
                membership,
            },
            event_rx,
        )
    }

    /// Replaces any previous connection and starts a new one.
    ///
    /// `register` is sent as soon as the transport opens; [`SignalEvent::Connected`]
    /// follows the server's acknowledgment.
    pub fn connect(
        &self,
        endpoint: impl Into<String>,
        credentials: Credentials,
    ) -> Result<(), SignalError> {
        if !credentials.is_complete() {
            return Err(SignalError::MissingCredentials);
        }
        self.send(Command::Connect {
            endpoint: endpoint.into(),
            credentials,
        })
    }

    /// Records the wish to be queued. Sent now if registered, otherwise right
    /// after the next registration.
    pub fn enqueue(&self, filters: MatchFilters) -> Result<(), SignalError> {
        self.send(Command::Enqueue(filters))
    }

    pub fn leave_queue(&self) -> Result<(), SignalError> {
        self.send(Command::LeaveQueue)
    }

    pub fn relay(
        &self,
        room_id: impl Into<String>,
        payload: RelayPayload,
    ) -> Result<(), SignalError> {
        self.send(Command::Relay {
            room_id: room_id.into(),
            payload,
        })
    }

    pub fn leave_room(&self, room_id: Option<String>) -> Result<(), SignalError> {
        self.send(Command::LeaveRoom { room_id })
    }

    /// Manual close. Cancels any pending reconnect; closing twice is harmless.
    pub fn close(&self) {
        if self.send(Command::Close).is_err() {
            debug!(target: "Signal", "close() on a client that already shut down");
        }
    }

    pub fn status(&self) -> SignalStatus {
        *self.status.borrow()
    }

    pub fn membership(&self) -> Membership {
        self.membership.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SignalStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> Result<(), SignalError> {
        self.command_tx
            .send(command)
            .map_err(|_| SignalError::Shutdown)
    }
}

struct SignalActor {
    factory: Arc<dyn TransportFactory>,
    config: SignalConfig,
    command_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    status_tx: watch::Sender<SignalStatus>,
    membership_tx: watch::Sender<Membership>,

    /// Bumped on every dial, connect and close.
    instance: u64,
    target: Option<(String, Credentials)>,
    transport: Option<Arc<dyn Transport>>,
    link_up: bool,
    registered: bool,
    manual_close: bool,
    pending: VecDeque<ClientMessage>,
    queue_intent: Option<MatchFilters>,
    backoff: ReconnectBackoff,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl SignalActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close().await;
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        debug!(target: "Signal", "Signaling client stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                endpoint,
                credentials,
            } => {
                self.cancel_reconnect();
                self.teardown_transport().await;
                self.registered = false;
                self.manual_close = false;
                self.pending.clear();
                self.queue_intent = None;
                self.backoff.reset();
                self.set_membership(Membership::Idle);
                self.target = Some((endpoint, credentials));
                self.dial();
            }
            Command::Enqueue(filters) => {
                self.queue_intent = Some(filters.clone());
                if self.registered {
                    self.send(ClientMessage::Enqueue(filters)).await;
                } else {
                    debug!(target: "Signal", "Enqueue deferred until registration");
                }
            }
            Command::LeaveQueue => {
                self.queue_intent = None;
                if *self.membership_tx.borrow() == Membership::Queued {
                    self.set_membership(Membership::Idle);
                }
                self.send(ClientMessage::Dequeue).await;
            }
            Command::Relay { room_id, payload } => {
                self.send(ClientMessage::Signal {
                    room_id,
                    data: payload.to_value(),
                })
                .await;
            }
            Command::LeaveRoom { room_id } => {
                self.queue_intent = None;
                self.set_membership(Membership::Idle);
                self.send(ClientMessage::Leave { room_id }).await;
            }
            Command::Close => self.close().await,
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Dialed { instance, result } => {
                if instance != self.instance {
                    if let Ok((transport, _)) = result {
                        debug!(target: "Signal", "Discarding transport from superseded dial");
                        transport.disconnect().await;
                    }
                    return;
                }
                match result {
                    Ok((transport, events)) => {
                        self.transport = Some(transport);
                        self.spawn_pump(instance, events);
                    }
                    Err(e) => {
                        warn!(target: "Signal", "Failed to connect: {e}");
                        self.on_link_lost();
                    }
                }
            }
            Internal::Transport { instance, event } => {
                if instance != self.instance {
                    debug!(target: "Signal", "Ignoring {event:?} from stale connection {instance}");
                    return;
                }
                match event {
                    TransportEvent::Connected => self.on_transport_open().await,
                    TransportEvent::TextReceived(text) => self.handle_frame(&text).await,
                    TransportEvent::Disconnected => {
                        if self.transport.take().is_some() {
                            info!(target: "Signal", "Connection lost");
                            self.on_link_lost();
                        }
                    }
                }
            }
            Internal::ReconnectDue { instance } => {
                if instance != self.instance || self.manual_close {
                    return;
                }
                self.reconnect_timer = None;
                self.dial();
            }
        }
    }

    fn dial(&mut self) {
        let Some((endpoint, _)) = self.target.clone() else {
            return;
        };
        self.instance += 1;
        let instance = self.instance;
        self.set_status(SignalStatus::Connecting);

        let factory = self.factory.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = factory.create_transport(&endpoint).await;
            let _ = internal_tx.send(Internal::Dialed { instance, result });
        });
    }

    fn spawn_pump(&self, instance: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = event == TransportEvent::Disconnected;
                if internal_tx
                    .send(Internal::Transport { instance, event })
                    .is_err()
                    || closed
                {
                    return;
                }
            }
            let _ = internal_tx.send(Internal::Transport {
                instance,
                event: TransportEvent::Disconnected,
            });
        });
    }

    async fn on_transport_open(&mut self) {
        let Some((_, credentials)) = self.target.clone() else {
            return;
        };
        self.link_up = true;
        self.set_status(SignalStatus::AwaitingRegistration);
        let register = ClientMessage::Register {
            token: credentials.token,
            session_id: credentials.session_id,
        };
        self.write(&register).await;
    }

    fn on_link_lost(&mut self) {
        let was_up = std::mem::replace(&mut self.link_up, false);
        self.registered = false;
        self.transport = None;
        if self.manual_close {
            return;
        }
        if was_up {
            self.emit(SignalEvent::Disconnected);
        }

        let jitter_ms = rand::rng().random_range(0..RECONNECT_MAX_JITTER.as_millis() as u64);
        let delay = self.backoff.next_delay(Duration::from_millis(jitter_ms));
        info!(
            target: "Signal/Reconnect",
            "Reconnecting in {:?} (attempt {})",
            delay,
            self.backoff.attempt()
        );
        self.set_status(SignalStatus::Disconnected);

        self.cancel_reconnect();
        let instance = self.instance;
        let internal_tx = self.internal_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal_tx.send(Internal::ReconnectDue { instance });
        }));
    }

    async fn handle_frame(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "Signal", "Dropping malformed frame: {e}");
                self.emit(SignalEvent::ProtocolError(e.to_string()));
                return;
            }
        };

        match message {
            ServerMessage::Hello => debug!(target: "Signal", "<-- hello"),
            ServerMessage::Registered { .. } => self.on_registered().await,
            ServerMessage::Enqueued => {
                self.set_membership(Membership::Queued);
                self.emit(SignalEvent::Queued);
            }
            ServerMessage::Dequeued => {
                debug!(target: "Signal", "<-- dequeued");
                self.set_membership(Membership::Idle);
            }
            ServerMessage::Matched { room_id, initiator } => {
                self.queue_intent = None;
                self.set_membership(Membership::InRoom(room_id.clone()));
                self.emit(SignalEvent::Matched {
                    room_id,
                    role: Role::from_initiator(initiator),
                });
            }
            ServerMessage::Signal { room_id, data } => match RelayPayload::from_value(data) {
                Ok(RelayPayload::End) => self.emit(SignalEvent::End),
                Ok(payload) => self.emit(SignalEvent::Relay { room_id, payload }),
                Err(e) => {
                    warn!(target: "Signal", "Dropping malformed relay: {e}");
                    self.emit(SignalEvent::ProtocolError(e.to_string()));
                }
            },
            ServerMessage::PeerLeft | ServerMessage::Left => {
                self.set_membership(Membership::Idle);
                self.emit(SignalEvent::End);
            }
            // Ack to our own leave; never a peer departure.
            ServerMessage::LeftOk => debug!(target: "Signal", "<-- left_ok"),
            ServerMessage::Error { reason } => {
                warn!(target: "Signal", "Server error: {reason}");
                self.emit(SignalEvent::ServerError(reason));
            }
            ServerMessage::Unknown { kind } => {
                self.emit(SignalEvent::ProtocolError(format!(
                    "unknown message type '{kind}'"
                )));
            }
        }
    }

    async fn on_registered(&mut self) {
        info!(target: "Signal", "Registered");
        self.registered = true;
        self.backoff.reset();
        self.set_status(SignalStatus::Registered);
        self.emit(SignalEvent::Connected);

        while let Some(message) = self.pending.pop_front() {
            if !self.write(&message).await {
                self.pending.push_front(message);
                return;
            }
        }
        if let Some(filters) = self.queue_intent.clone() {
            self.write(&ClientMessage::Enqueue(filters)).await;
        }
    }

    async fn close(&mut self) {
        self.manual_close = true;
        self.instance += 1;
        self.cancel_reconnect();
        self.teardown_transport().await;
        self.registered = false;
        self.queue_intent = None;
        self.set_membership(Membership::Idle);
        self.set_status(SignalStatus::Closed);
    }

    /// Sends now when registered, otherwise parks the message in the pending buffer.
    async fn send(&mut self, message: ClientMessage) {
        if self.registered && self.write(&message).await {
            return;
        }
        self.buffer(message);
    }

    fn buffer(&mut self, message: ClientMessage) {
        self.pending.push_back(message);
        while self.pending.len() > self.config.pending_capacity {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    target: "Signal",
                    "Pending buffer full, dropping oldest '{}'",
                    dropped.kind()
                );
            }
        }
    }

    async fn write(&self, message: &ClientMessage) -> bool {
        let Some(transport) = self.transport.clone() else {
            return false;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "Signal", "Failed to encode '{}': {e}", message.kind());
                return false;
            }
        };
        match transport.send_text(&text).await {
            Ok(()) => {
                debug!(target: "Signal", "--> {}", message.kind());
                true
            }
            Err(e) => {
                warn!(target: "Signal", "Failed to send '{}': {e}", message.kind());
                false
            }
        }
    }

    async fn teardown_transport(&mut self) {
        self.link_up = false;
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn emit(&self, event: SignalEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, status: SignalStatus) {
        self.status_tx.send_replace(status);
    }

    fn set_membership(&self, membership: Membership) {
        self.membership_tx.send_replace(membership);
    }
}
