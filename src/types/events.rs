use ranchat_core::ice::IcePathInfo;
use ranchat_core::protocol::PeerMetadata;
use ranchat_core::types::{EndCause, Phase, Role};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

use crate::media::TrackKind;

/// Everything the call orchestrator reports to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    PhaseChanged(Phase),
    Matched {
        room_id: String,
        role: Role,
    },
    PeerInfo(PeerMetadata),
    /// The peer toggled its camera.
    RemoteCamera {
        enabled: bool,
    },
    LocalStreamReady,
    RemoteStreamReady {
        kind: TrackKind,
    },
    MediaConnected,
    IcePath(IcePathInfo),
    /// Signaling dropped mid-call and is reconnecting.
    NetworkUnstable(bool),
    /// Transient "still looking" hint for entitled users.
    FastMatchHint(bool),
    /// Blocking retry/exit prompt after the no-match timeout.
    NoMatchPrompt,
    FreeLimitReached,
    RemoteVideoAllowed(bool),
    CallEnded {
        cause: EndCause,
    },
    CallError(String),
    ServerError(String),
    ProtocolError(String),
    AuthFailed(String),
    Exited,
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("has_handlers", &self.has_handlers())
            .finish()
    }
}
