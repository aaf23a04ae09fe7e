use slotsync_core::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use url::Url;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

const LOCAL_API_HOST: &str = "127.0.0.1:8000";
const REMOTE_API_HOST: &str = "api.example.com";

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

/// Where the API lives relative to the host the panel is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Local,
    Remote,
}

impl Deployment {
    pub fn from_host(host: &str) -> Self {
        let name = host.trim().rsplit_once(':').map_or(host.trim(), |(name, _)| name);
        match name {
            "localhost" | "127.0.0.1" => Deployment::Local,
            _ => Deployment::Remote,
        }
    }

    pub fn api_host(&self) -> &'static str {
        match self {
            Deployment::Local => LOCAL_API_HOST,
            Deployment::Remote => REMOTE_API_HOST,
        }
    }

    pub fn channel_url(&self, secure: bool) -> Result<Url, url::ParseError> {
        let scheme = if secure { "wss" } else { "ws" };
        Url::parse(&format!("{scheme}://{}/ws", self.api_host()))
    }

    pub fn api_url(&self, secure: bool) -> Result<Url, url::ParseError> {
        let scheme = if secure { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{}/", self.api_host()))
    }
}

/// Non-empty, trimmed environment value.
pub fn env_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
