//! Device identity and token binding.

pub mod bind;
pub mod device_key;

use async_trait::async_trait;
use log::info;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub use bind::{BindError, HttpDeviceBinder, TokenBinder};
pub use device_key::{DeviceIdentity, FileDeviceKeyStore, IdentityError};

/// The device key that was bound plus the token and user id the bind
/// call returned. `device_key` is the signaling session id.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub device_key: String,
    pub token: String,
    pub user_id: String,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("device_key", &self.device_key)
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Supplies credentials for the signaling `register` message.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self) -> Result<AuthSession, AuthError>;
}

/// Device key lookup plus bind, performed once and cached.
pub struct AuthBootstrap {
    identity: Arc<dyn DeviceIdentity>,
    binder: Arc<dyn TokenBinder>,
    cached: Mutex<Option<AuthSession>>,
}

impl AuthBootstrap {
    pub fn new(identity: Arc<dyn DeviceIdentity>, binder: Arc<dyn TokenBinder>) -> Self {
        Self {
            identity,
            binder,
            cached: Mutex::new(None),
        }
    }

    /// Forgets the cached token so the next session() binds again.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[async_trait]
impl SessionProvider for AuthBootstrap {
    async fn session(&self) -> Result<AuthSession, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }
        let device_key = self.identity.get_or_create_device_key().await?;
        let session = self.binder.bind(&device_key).await?;
        info!(target: "Auth", "Bound as user {}", session.user_id);
        *cached = Some(session.clone());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedKey;

    #[async_trait]
    impl DeviceIdentity for FixedKey {
        async fn get_or_create_device_key(&self) -> Result<String, IdentityError> {
            Ok("device-1".into())
        }
    }

    #[derive(Default)]
    struct CountingBinder(AtomicUsize);

    #[async_trait]
    impl TokenBinder for CountingBinder {
        async fn bind(&self, device_key: &str) -> Result<AuthSession, BindError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AuthSession {
                device_key: device_key.into(),
                token: format!("{device_key}-token-{n}"),
                user_id: "u1".into(),
            })
        }
    }

    #[tokio::test]
    async fn binds_once_until_invalidated() {
        let binder = Arc::new(CountingBinder::default());
        let bootstrap = AuthBootstrap::new(Arc::new(FixedKey), binder.clone());

        let first = bootstrap.session().await.unwrap();
        assert_eq!(first.device_key, "device-1");
        assert_eq!(first.token, "device-1-token-0");
        assert_eq!(bootstrap.session().await.unwrap(), first);
        assert_eq!(binder.0.load(Ordering::SeqCst), 1);

        bootstrap.invalidate().await;
        assert_eq!(bootstrap.session().await.unwrap().token, "device-1-token-1");
    }

    #[test]
    fn debug_output_hides_the_token() {
        let session = AuthSession {
            device_key: "d".into(),
            token: "secret".into(),
            user_id: "u".into(),
        };
        assert!(!format!("{session:?}").contains("secret"));
    }
}
