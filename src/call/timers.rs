use super::orchestrator::Input;
use log::trace;
use ranchat_core::generation::Token;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    NoMatch,
    FastMatchHint,
    PeerReady,
    MediaWatchdog,
    ConnectivityDebounce,
    FreeLimit,
    Requeue,
}

/// One slot per kind. Arming a kind replaces (and aborts) the previous timer.
pub(crate) struct Timers {
    inbox: mpsc::UnboundedSender<Input>,
    handles: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_seq: u64,
}

impl Timers {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            inbox,
            handles: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, delay: Duration, token: Token) {
        self.cancel(kind);
        trace!(target: "Call/Timer", "Arming {kind:?} for {delay:?} (token {token})");
        self.next_seq += 1;
        let seq = self.next_seq;
        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Input::Timer { kind, token, seq });
        });
        self.handles.insert(kind, (seq, handle));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.handles.remove(&kind) {
            handle.abort();
        }
    }

    /// Claims a firing. False when the slot was re-armed or cancelled after
    /// the firing was queued.
    pub(crate) fn fired(&mut self, kind: TimerKind, seq: u64) -> bool {
        match self.handles.get(&kind) {
            Some((armed, _)) if *armed == seq => {
                self.handles.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_supersedes_a_queued_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::NoMatch, Duration::from_secs(1), 7);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let Some(Input::Timer { kind, token, seq }) = rx.recv().await else {
            panic!("expected a timer firing");
        };
        assert_eq!((kind, token), (TimerKind::NoMatch, 7));

        timers.arm(TimerKind::NoMatch, Duration::from_secs(1), 8);
        assert!(!timers.fired(kind, seq));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(Input::Timer { token, seq, .. }) = rx.recv().await else {
            panic!("expected a timer firing");
        };
        assert_eq!(token, 8);
        assert!(timers.fired(TimerKind::NoMatch, seq));
        assert!(!timers.fired(TimerKind::NoMatch, seq));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::PeerReady, Duration::from_millis(100), 1);
        timers.arm(TimerKind::FreeLimit, Duration::from_millis(100), 1);
        timers.cancel_all();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
