use super::AuthSession;
use async_trait::async_trait;
use log::{debug, info};
use ranchat_core::net::{HttpClient, HttpRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("no auth base URL configured")]
    MissingBaseUrl,

    #[error("bind failed with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("no bind endpoint found (last 404 body: {last_body})")]
    NotFound { last_body: String },

    #[error("bind response missing token or userId")]
    InvalidResponse,

    #[error("bind request failed: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Exchanges a device key for an auth token.
#[async_trait]
pub trait TokenBinder: Send + Sync {
    async fn bind(&self, device_key: &str) -> Result<AuthSession, BindError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BindRequest<'a> {
    device_key: &'a str,
    platform: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindResponse {
    #[serde(default)]
    token: Value,
    #[serde(default)]
    user_id: Value,
}

/// Token and user id may come back as strings or numbers.
fn scalar_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Bind paths tried for one base URL, in order.
pub fn candidate_urls(base: &str) -> Vec<String> {
    let base = base.trim();
    let base = base.strip_suffix('/').unwrap_or(base);
    let mut paths = vec!["/device/bind", "/bind"];
    if !base.to_ascii_lowercase().ends_with("/api") {
        paths.extend(["/api/device/bind", "/api/bind"]);
    }
    paths.into_iter().map(|p| format!("{base}{p}")).collect()
}

pub struct HttpDeviceBinder {
    http: Arc<dyn HttpClient>,
    base_urls: Vec<String>,
    platform: String,
}

impl HttpDeviceBinder {
    pub fn new(http: Arc<dyn HttpClient>, base_urls: Vec<String>, platform: impl Into<String>) -> Self {
        Self {
            http,
            base_urls,
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl TokenBinder for HttpDeviceBinder {
    async fn bind(&self, device_key: &str) -> Result<AuthSession, BindError> {
        let bases: Vec<&str> = self
            .base_urls
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect();
        if bases.is_empty() {
            return Err(BindError::MissingBaseUrl);
        }

        let body = BindRequest {
            device_key,
            platform: &self.platform,
        };
        let mut last_body = String::new();
        for url in bases.into_iter().flat_map(candidate_urls) {
            debug!(target: "Auth", "POST {url}");
            let request = HttpRequest::post(&url).with_json(&body)?;
            let response = self.http.execute(request).await?;

            if response.status_code == 404 {
                last_body = response.body_string();
                continue;
            }
            if !response.is_success() {
                return Err(BindError::Http {
                    status: response.status_code,
                    body: response.body_string(),
                });
            }

            let parsed: BindResponse =
                serde_json::from_slice(&response.body).map_err(|_| BindError::InvalidResponse)?;
            let (Some(token), Some(user_id)) = (
                scalar_to_string(&parsed.token),
                scalar_to_string(&parsed.user_id),
            ) else {
                return Err(BindError::InvalidResponse);
            };
            info!(target: "Auth", "Device bound via {url}");
            return Ok(AuthSession {
                device_key: device_key.to_string(),
                token,
                user_id,
            });
        }

        Err(BindError::NotFound { last_body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHttpClient;

    #[test]
    fn api_suffixed_bases_skip_the_api_variants() {
        assert_eq!(
            candidate_urls("https://h.example/"),
            vec![
                "https://h.example/device/bind",
                "https://h.example/bind",
                "https://h.example/api/device/bind",
                "https://h.example/api/bind",
            ]
        );
        assert_eq!(
            candidate_urls("https://h.example/API"),
            vec!["https://h.example/API/device/bind", "https://h.example/API/bind"]
        );
    }

    fn binder(http: &Arc<MockHttpClient>) -> HttpDeviceBinder {
        HttpDeviceBinder::new(http.clone(), vec!["http://auth.test".into()], "linux")
    }

    #[tokio::test]
    async fn not_found_moves_to_the_next_candidate() {
        let http = Arc::new(MockHttpClient::new());
        http.respond("http://auth.test/device/bind", 404, "nope");
        http.respond(
            "http://auth.test/bind",
            200,
            r#"{"token":"t-1","userId":42}"#,
        );

        let session = binder(&http).bind("dev-key").await.unwrap();
        assert_eq!(session.token, "t-1");
        assert_eq!(session.user_id, "42");
        assert_eq!(session.device_key, "dev-key");

        let requests = http.requests();
        assert_eq!(requests.len(), 2);
        let body: Value = serde_json::from_slice(requests[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["deviceKey"], "dev-key");
        assert_eq!(body["platform"], "linux");
    }

    #[tokio::test]
    async fn other_statuses_are_fatal() {
        let http = Arc::new(MockHttpClient::new());
        http.respond("http://auth.test/device/bind", 500, "boom");
        let err = binder(&http).bind("k").await.unwrap_err();
        assert!(matches!(err, BindError::Http { status: 500, .. }));
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_candidates_report_not_found() {
        let http = Arc::new(MockHttpClient::new());
        let err = binder(&http).bind("k").await.unwrap_err();
        assert!(matches!(err, BindError::NotFound { .. }));
        assert_eq!(http.requests().len(), 4);
    }

    #[tokio::test]
    async fn incomplete_body_is_invalid() {
        let http = Arc::new(MockHttpClient::new());
        http.respond("http://auth.test/device/bind", 200, r#"{"token":"t"}"#);
        let err = binder(&http).bind("k").await.unwrap_err();
        assert!(matches!(err, BindError::InvalidResponse));
    }

    #[tokio::test]
    async fn missing_base_url() {
        let http = Arc::new(MockHttpClient::new());
        let binder = HttpDeviceBinder::new(http, vec!["  ".into()], "linux");
        assert!(matches!(binder.bind("k").await, Err(BindError::MissingBaseUrl)));
    }
}
