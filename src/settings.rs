use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{
    consts::{
        DEFAULT_BASE_URL, DEFAULT_HEALTH_PATH, DEFAULT_STREAM_PATH, EVENT_BUS_CAPACITY,
        PROBE_TIMEOUT_MS, RECONNECT_BACKOFF_MULTIPLIER, RECONNECT_INITIAL_DELAY_MS,
        RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY_MS, RECONNECT_SETTLE_MS, REQUEST_TIMEOUT_SECS,
        STREAM_CONNECT_TIMEOUT_SECS, STREAM_HANDSHAKE_TIMEOUT_SECS, STREAM_WATCHDOG_INTERVAL_MS,
    },
    error::{LiveError, Result},
};

const ENV_BASE_URL: &str = "TASKLIST_LIVE_BASE_URL";
const ENV_MAX_ATTEMPTS: &str = "TASKLIST_LIVE_MAX_ATTEMPTS";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub settle_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            backoff_multiplier: RECONNECT_BACKOFF_MULTIPLIER,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
            settle_ms: RECONNECT_SETTLE_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub stream_path: String,
    pub health_path: String,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    /// Upper bound for every REST call other than the probe.
    pub request_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
    pub event_capacity: usize,
    pub session_file: Option<PathBuf>,
    pub reconnect: ReconnectSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            connect_timeout_secs: STREAM_CONNECT_TIMEOUT_SECS,
            handshake_timeout_secs: STREAM_HANDSHAKE_TIMEOUT_SECS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            watchdog_interval_ms: STREAM_WATCHDOG_INTERVAL_MS,
            event_capacity: EVENT_BUS_CAPACITY,
            session_file: None,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `path`; a missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)?;
                serde_json::from_str::<Settings>(&content)
                    .map_err(|error| LiveError::Config(format!("failed to parse settings: {error}")))?
            }
            Some(path) => {
                tracing::debug!(?path, "settings file not found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS).filter(|v| !v.trim().is_empty()) {
            self.reconnect.max_attempts = raw.trim().parse().map_err(|_| {
                LiveError::Config(format!("{ENV_MAX_ATTEMPTS} must be a non-negative integer, got {raw:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.base_url = normalize_base_url(&self.base_url)?;
        let reconnect = &self.reconnect;
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(LiveError::Config(
                "reconnect.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if reconnect.initial_delay_ms == 0 {
            return Err(LiveError::Config(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(LiveError::Config(
                "reconnect.max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        if self.watchdog_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(LiveError::Config(
                "watchdog_interval_ms and probe_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(LiveError::Config(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stream_url(&self) -> Result<String> {
        build_stream_ws_url(&self.base_url, &self.stream_path)
    }

    pub fn health_url(&self) -> String {
        join_path(&self.base_url, &self.health_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

pub fn normalize_base_url(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(LiveError::Config("server URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|error| LiveError::Config(format!("invalid server URL: {error}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(LiveError::Config(
            "server URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

/// Derive the push-channel URL from the REST base: http becomes ws, https
/// becomes wss, and `stream_path` is appended to the base path.
pub fn build_stream_ws_url(base_url: &str, stream_path: &str) -> Result<String> {
    let mut ws_url = reqwest::Url::parse(base_url)
        .map_err(|error| LiveError::Config(format!("invalid server URL: {error}")))?;

    let scheme = match ws_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(LiveError::Config(
                "server URL must start with http:// or https://".to_string(),
            ))
        }
    };
    ws_url
        .set_scheme(scheme)
        .map_err(|_| LiveError::Config(format!("unable to convert URL scheme to {scheme}")))?;

    let mut path = ws_url.path().trim_end_matches('/').to_string();
    path.push('/');
    path.push_str(stream_path.trim_start_matches('/'));
    ws_url.set_path(&path);
    Ok(ws_url.to_string())
}

fn join_path(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
