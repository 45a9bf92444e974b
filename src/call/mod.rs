//! Call orchestrator: queue cycles, matches, media lifecycle and teardown.

pub mod error;
pub mod orchestrator;
mod timers;

use crate::auth::SessionProvider;
use crate::media::MediaSessionFactory;
use crate::services::ads::InterstitialGate;
use crate::services::entitlements::Entitlements;
use crate::signal::SignalConfig;
use ranchat_core::net::TransportFactory;
use ranchat_core::protocol::{MatchFilters, PeerMetadata};
use std::sync::Arc;
use std::time::Duration;

pub use error::CallError;
pub use orchestrator::{CallHandle, CallOrchestrator};

/// What we tell the peer about ourselves after a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProfile {
    pub country: String,
    pub language: String,
    pub gender: String,
    pub flag: String,
}

impl Default for LocalProfile {
    fn default() -> Self {
        Self {
            country: "ALL".to_string(),
            language: "en".to_string(),
            gender: "all".to_string(),
            flag: String::new(),
        }
    }
}

impl LocalProfile {
    pub(crate) fn metadata(&self, nonce: &str) -> PeerMetadata {
        PeerMetadata {
            country: self.country.clone(),
            language: self.language.clone(),
            gender: self.gender.clone(),
            flag: self.flag.clone(),
            nonce: nonce.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub signaling_url: String,
    pub filters: MatchFilters,
    pub profile: LocalProfile,
    pub no_match_timeout: Duration,
    pub fast_match_hint_duration: Duration,
    pub peer_ready_timeout: Duration,
    pub media_connect_timeout: Duration,
    pub connectivity_debounce: Duration,
    pub remote_left_requeue_delay: Duration,
    pub free_call_limit: Duration,
    pub signal: SignalConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: String::new(),
            filters: MatchFilters::new("ALL", "all", std::env::consts::OS),
            profile: LocalProfile::default(),
            no_match_timeout: Duration::from_secs(20),
            fast_match_hint_duration: Duration::from_secs(3),
            peer_ready_timeout: Duration::from_millis(1500),
            media_connect_timeout: Duration::from_secs(4),
            connectivity_debounce: Duration::from_millis(500),
            remote_left_requeue_delay: Duration::from_secs(1),
            free_call_limit: Duration::from_secs(3000),
            signal: SignalConfig::default(),
        }
    }
}

pub(crate) fn validate_filters(filters: &MatchFilters) -> Result<(), CallError> {
    if filters.country.trim().is_empty() {
        return Err(CallError::InvalidFilters("country"));
    }
    if filters.gender.trim().is_empty() {
        return Err(CallError::InvalidFilters("gender"));
    }
    Ok(())
}

/// Collaborators the orchestrator drives. Each is shared by `Arc`.
#[derive(Clone)]
pub struct CallDependencies {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub media_factory: Arc<dyn MediaSessionFactory>,
    pub sessions: Arc<dyn SessionProvider>,
    pub entitlements: Arc<dyn Entitlements>,
    pub interstitials: Arc<dyn InterstitialGate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_need_country_and_gender() {
        assert!(validate_filters(&MatchFilters::new("KR", "male", "linux")).is_ok());
        assert_eq!(
            validate_filters(&MatchFilters::new(" ", "male", "linux")),
            Err(CallError::InvalidFilters("country"))
        );
        assert_eq!(
            validate_filters(&MatchFilters::new("KR", "", "linux")),
            Err(CallError::InvalidFilters("gender"))
        );
    }

    #[test]
    fn metadata_carries_the_cycle_nonce() {
        let meta = LocalProfile::default().metadata("abc");
        assert_eq!(meta.nonce, "abc");
        assert_eq!(meta.country, "ALL");
    }
}
