use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device key storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device key encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Source of the stable per-install device key.
#[async_trait]
pub trait DeviceIdentity: Send + Sync {
    async fn get_or_create_device_key(&self) -> Result<String, IdentityError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDeviceKey {
    device_key: String,
    created_at: String,
}

/// Keeps the device key in a small JSON file. The key is created once and
/// reused for every later bind.
pub struct FileDeviceKeyStore {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileDeviceKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<Option<String>, IdentityError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<StoredDeviceKey>(&bytes) {
            Ok(stored) if !stored.device_key.trim().is_empty() => {
                Ok(Some(stored.device_key.trim().to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(target: "Auth", "Unreadable device key at {:?}, replacing it: {e}", self.path);
                Ok(None)
            }
        }
    }

    async fn store(&self, device_key: &str) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stored = StoredDeviceKey {
            device_key: device_key.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&stored)?).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceIdentity for FileDeviceKeyStore {
    async fn get_or_create_device_key(&self) -> Result<String, IdentityError> {
        let mut cached = self.cached.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.load().await? {
            Some(key) => key,
            None => {
                let key = uuid::Uuid::new_v4().to_string();
                self.store(&key).await?;
                info!(target: "Auth", "Created device key at {:?}", self.path);
                key
            }
        };
        *cached = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_is_created_once_and_reused_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device_key.json");

        let first = FileDeviceKeyStore::new(&path);
        let key = first.get_or_create_device_key().await.unwrap();
        assert_eq!(uuid::Uuid::parse_str(&key).unwrap().get_version_num(), 4);
        assert_eq!(first.get_or_create_device_key().await.unwrap(), key);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["deviceKey"], key.as_str());
        assert!(raw["createdAt"].is_string());

        let second = FileDeviceKeyStore::new(&path);
        assert_eq!(second.get_or_create_device_key().await.unwrap(), key);
    }

    #[tokio::test]
    async fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_key.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileDeviceKeyStore::new(&path);
        let key = store.get_or_create_device_key().await.unwrap();
        assert!(!key.is_empty());
        let reread = FileDeviceKeyStore::new(&path);
        assert_eq!(reread.get_or_create_device_key().await.unwrap(), key);
    }
}
