use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A token minted by [`Generation::bump`]. Continuations capture one and
/// compare it against the counter before touching shared state.
pub type Token = u64;

/// Monotonic generation counter used to invalidate stale async work.
///
/// Cloning shares the same counter.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new token, invalidating every previously issued one.
    pub fn bump(&self) -> Token {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Token {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, token: Token) -> bool {
        self.current() == token
    }
}
