use ranchat_core::protocol::MatchFilters;
use std::path::PathBuf;
use std::time::Duration;

use crate::call::{CallConfig, LocalProfile};
use crate::media::{IceServers, MediaConfig, TurnServer};
use crate::services::ads::AdConfig;

const ENV_PREFIX: &str = "RANCHAT_";

/// Application-level settings. Defaults match the public test deployment and
/// every field can be overridden from `RANCHAT_*` environment variables.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub signaling_url: String,
    pub auth_base_urls: Vec<String>,
    pub stun_urls: Vec<String>,
    pub turn: TurnServer,
    pub match_timeout: Duration,
    pub free_call_limit: Duration,
    pub entitlement_id: String,
    pub device_key_path: PathBuf,
    pub platform: String,
    pub filters: MatchFilters,
    pub profile: LocalProfile,
    pub preferred_video_codec: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let turn = TurnServer {
            host: "152.67.213.225".to_string(),
            port: 3478,
            username: "testuser".to_string(),
            credential: "testpass".to_string(),
            use_tcp: false,
        };
        let platform = std::env::consts::OS.to_string();
        Self {
            signaling_url: "ws://152.67.213.225:3001".to_string(),
            auth_base_urls: vec!["http://152.67.213.225:3001".to_string()],
            stun_urls: vec![
                format!("stun:{}:{}", turn.host, turn.port),
                "stun:stun.l.google.com:19302".to_string(),
            ],
            turn,
            match_timeout: Duration::from_millis(20_000),
            free_call_limit: Duration::from_secs(3000),
            entitlement_id: "premium".to_string(),
            device_key_path: PathBuf::from("ranchat_device_key_v1.json"),
            filters: MatchFilters::new("ALL", "all", platform.clone()),
            platform,
            profile: LocalProfile::default(),
            preferred_video_codec: Some("H264".to_string()),
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with whatever `RANCHAT_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let read_ms = |key: &str| read(key).and_then(|v| v.parse::<u64>().ok());

        let mut config = Self::default();
        if let Some(url) = read("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(urls) = read("AUTH_HTTP_BASE_URL") {
            config.auth_base_urls = urls
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
        if let Some(urls) = read("STUN_URLS") {
            config.stun_urls = urls.split(',').map(|u| u.trim().to_string()).collect();
        }
        if let Some(host) = read("TURN_HOST") {
            config.turn.host = host;
        }
        if let Some(port) = read("TURN_PORT").and_then(|p| p.parse::<u16>().ok()) {
            if port > 0 {
                config.turn.port = port;
            }
        }
        if let Some(username) = read("TURN_USERNAME") {
            config.turn.username = username;
        }
        if let Some(password) = read("TURN_PASSWORD") {
            config.turn.credential = password;
        }
        if let Some(tcp) = read("TURN_TCP") {
            config.turn.use_tcp = matches!(tcp.as_str(), "1" | "true" | "yes");
        }
        if let Some(ms) = read_ms("MATCH_TIMEOUT_MS") {
            config.match_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_ms("FREE_CALL_LIMIT_MS") {
            config.free_call_limit = Duration::from_millis(ms);
        }
        if let Some(id) = read("ENTITLEMENT_ID") {
            config.entitlement_id = id;
        }
        if let Some(path) = read("DEVICE_KEY_PATH") {
            config.device_key_path = PathBuf::from(path);
        }
        if let Some(country) = read("MATCH_COUNTRY") {
            config.filters.country = country;
        }
        if let Some(gender) = read("MATCH_GENDER") {
            config.filters.gender = gender;
        }
        if let Some(codec) = read("VIDEO_CODEC") {
            config.preferred_video_codec = Some(codec);
        }
        config
    }

    pub fn media_config(&self) -> MediaConfig {
        MediaConfig {
            ice_servers: IceServers {
                stun_urls: self.stun_urls.clone(),
                turn: Some(self.turn.clone()),
            },
            preferred_video_codec: self.preferred_video_codec.clone(),
            ..MediaConfig::default()
        }
    }

    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            signaling_url: self.signaling_url.clone(),
            filters: self.filters.clone(),
            profile: self.profile.clone(),
            no_match_timeout: self.match_timeout,
            free_call_limit: self.free_call_limit,
            ..CallConfig::default()
        }
    }

    pub fn ad_config(&self) -> AdConfig {
        AdConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overrides_come_from_prefixed_keys() {
        let vars: HashMap<&str, &str> = [
            ("RANCHAT_SIGNALING_URL", "wss://signal.example"),
            ("RANCHAT_AUTH_HTTP_BASE_URL", "https://a.example/api, https://b.example"),
            ("RANCHAT_TURN_PORT", "5349"),
            ("RANCHAT_TURN_TCP", "true"),
            ("RANCHAT_MATCH_TIMEOUT_MS", "5000"),
            ("RANCHAT_MATCH_COUNTRY", "KR"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.signaling_url, "wss://signal.example");
        assert_eq!(
            config.auth_base_urls,
            vec!["https://a.example/api", "https://b.example"]
        );
        assert_eq!(config.turn.port, 5349);
        assert!(config.turn.use_tcp);
        assert_eq!(config.match_timeout, Duration::from_secs(5));
        assert_eq!(config.filters.country, "KR");
        assert_eq!(config.call_config().no_match_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = AppConfig::from_lookup(|k| match k {
            "RANCHAT_TURN_PORT" => Some("99999".into()),
            "RANCHAT_MATCH_TIMEOUT_MS" => Some("soon".into()),
            "RANCHAT_SIGNALING_URL" => Some("   ".into()),
            _ => None,
        });
        let defaults = AppConfig::default();
        assert_eq!(config.turn.port, defaults.turn.port);
        assert_eq!(config.match_timeout, defaults.match_timeout);
        assert_eq!(config.signaling_url, defaults.signaling_url);
    }
}
