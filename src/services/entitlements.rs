use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Premium status as seen by the call orchestrator.
#[async_trait]
pub trait Entitlements: Send + Sync {
    fn is_premium(&self) -> bool;

    /// Re-reads the entitlement from its source and returns the new value.
    async fn refresh(&self) -> bool;
}

/// Store backend that knows which entitlements the user holds.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn active_entitlements(&self) -> Result<Vec<String>, anyhow::Error>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionState {
    pub is_premium: bool,
    pub entitlement_id: String,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Owns the subscription state. Without a source every session is free-tier.
pub struct SubscriptionStatus {
    source: Option<Arc<dyn EntitlementSource>>,
    entitlement_id: String,
    state: watch::Sender<SubscriptionState>,
    initialized: AtomicBool,
}

impl SubscriptionStatus {
    pub fn new(entitlement_id: impl Into<String>, source: Option<Arc<dyn EntitlementSource>>) -> Self {
        let entitlement_id = entitlement_id.into();
        let (state, _) = watch::channel(SubscriptionState {
            entitlement_id: entitlement_id.clone(),
            ..Default::default()
        });
        Self {
            source,
            entitlement_id,
            state,
            initialized: AtomicBool::new(false),
        }
    }

    /// First refresh. Later calls are no-ops.
    pub async fn init(&self) {
        if self.source.is_none() || self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.refresh().await;
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Overrides the premium flag, e.g. from a command-line switch.
    pub fn set_premium(&self, is_premium: bool) {
        self.state.send_modify(|s| {
            s.is_premium = is_premium;
            s.last_checked_at = Some(Utc::now());
        });
    }
}

#[async_trait]
impl Entitlements for SubscriptionStatus {
    fn is_premium(&self) -> bool {
        self.state.borrow().is_premium
    }

    async fn refresh(&self) -> bool {
        let Some(source) = &self.source else {
            return self.is_premium();
        };
        match source.active_entitlements().await {
            Ok(active) => {
                let is_premium = active.iter().any(|id| id == &self.entitlement_id);
                info!("Entitlement '{}' active: {is_premium}", self.entitlement_id);
                self.set_premium(is_premium);
                is_premium
            }
            Err(e) => {
                warn!("Entitlement refresh failed, keeping previous state: {e}");
                self.is_premium()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedSource(Mutex<Vec<Result<Vec<String>, anyhow::Error>>>);

    #[async_trait]
    impl EntitlementSource for ScriptedSource {
        async fn active_entitlements(&self) -> Result<Vec<String>, anyhow::Error> {
            self.0.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn refresh_tracks_the_configured_entitlement() {
        let source = Arc::new(ScriptedSource(Mutex::new(vec![
            Ok(vec!["other".into()]),
            Ok(vec!["premium".into()]),
            Err(anyhow::anyhow!("store offline")),
        ])));
        let status = SubscriptionStatus::new("premium", Some(source));
        let mut updates = status.subscribe();

        status.init().await;
        assert!(!status.is_premium());
        status.init().await;

        assert!(status.refresh().await);
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().is_premium);

        // A failing source keeps the last known value.
        assert!(status.refresh().await);
        assert!(status.state().last_checked_at.is_some());
    }

    #[tokio::test]
    async fn without_a_source_the_override_wins() {
        let status = SubscriptionStatus::new("premium", None);
        status.init().await;
        assert!(!status.refresh().await);
        status.set_premium(true);
        assert!(status.refresh().await);
    }
}
