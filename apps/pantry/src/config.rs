use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;
use url::Url;

use crate::auth::Credential;
use crate::transport::ReconnectPolicy;

pub const DEFAULT_SERVER: &str = "127.0.0.1:3001";
pub const DEFAULT_WS_PATH: &str = "ws/chat";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server address cannot be empty")]
    EmptyServer,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("unable to determine home directory")]
    NoHomeDir,
}

/// Pantry client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend address, with or without a scheme
    pub server: String,
    pub ws_path: String,
    pub token: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// `None` disables WebSocket pings
    pub heartbeat: Option<Duration>,
    pub history_guard_window: Duration,
    pub dedup_window: Duration,
    /// Overrides `~/.pantry` for persisted state
    pub state_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            token: None,
            reconnect_attempts: 10,
            reconnect_min: Duration::from_millis(1_000),
            reconnect_max: Duration::from_millis(10_000),
            heartbeat: Some(Duration::from_secs(25)),
            history_guard_window: Duration::from_millis(5_000),
            dedup_window: Duration::from_millis(1_000),
            state_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Blank values count as unset and
    /// unparsable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| get(key).and_then(|value| value.parse::<u64>().ok());
        let defaults = Self::default();

        let server = get("PANTRY_SERVER").unwrap_or(defaults.server);
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let heartbeat = match number("PANTRY_HEARTBEAT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.heartbeat,
        };

        Self {
            server,
            ws_path: get("PANTRY_WS_PATH").unwrap_or(defaults.ws_path),
            token: get("PANTRY_TOKEN"),
            reconnect_attempts: number("PANTRY_RECONNECT_ATTEMPTS")
                .and_then(|attempts| u32::try_from(attempts).ok())
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_min: number("PANTRY_RECONNECT_MIN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_min),
            reconnect_max: number("PANTRY_RECONNECT_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_max),
            heartbeat,
            history_guard_window: number("PANTRY_HISTORY_GUARD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.history_guard_window),
            dedup_window: number("PANTRY_DEDUP_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dedup_window),
            state_dir: get("PANTRY_STATE_DIR").map(PathBuf::from),
        }
    }

    /// REST base, always ending in `/` so relative endpoints join under it.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let mut base = self.server.trim().to_string();
        if base.is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base).map_err(|err| ConfigError::InvalidUrl(err.to_string()))
    }

    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        url.join(self.ws_path.trim_start_matches('/'))
            .map_err(|err| ConfigError::InvalidUrl(err.to_string()))
    }

    pub fn credential(&self) -> Option<Credential> {
        self.token.clone().and_then(Credential::new)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_attempts, self.reconnect_min, self.reconnect_max)
    }

    pub fn history_guard_path(&self) -> Result<PathBuf, ConfigError> {
        let dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => BaseDirs::new()
                .ok_or(ConfigError::NoHomeDir)?
                .home_dir()
                .join(".pantry"),
        };
        Ok(dir.join("history.guard"))
    }

    pub fn history_guard_window(&self) -> time::Duration {
        to_time(self.history_guard_window)
    }

    pub fn dedup_window(&self) -> time::Duration {
        to_time(self.dedup_window)
    }
}

fn to_time(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    // A single colon separates a port; more than one means a bare IPv6 host.
    let host = match host_part.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => host_part,
    }
    .to_ascii_lowercase();
    let private = host == "localhost"
        || host == "0.0.0.0"
        || host == "::1"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false);
    if private { "http://" } else { "https://" }
}
