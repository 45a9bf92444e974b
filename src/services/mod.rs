pub mod ads;
pub mod entitlements;

pub use ads::{AdConfig, AdEvent, AdManager, InterstitialGate, InterstitialPresenter};
pub use entitlements::{EntitlementSource, Entitlements, SubscriptionState, SubscriptionStatus};
