//! Configuration loaded once at startup and never mutated afterwards.
//!
//! Broker credentials go through the layered `config` builder so any field
//! can be overridden from the environment (`FXBOT_LOGIN`, `FXBOT_BRIDGE_URL`,
//! ...). Strategy parameters are plain JSON documents read with serde_json,
//! which keeps session and instrument keys case-sensitive.

use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::BotError;
use crate::Result;

fn default_bridge_url() -> String {
    "http://127.0.0.1:8765".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_requests_per_second() -> u32 {
    20
}

fn default_max_retries() -> u32 {
    3
}

/// Terminal credentials and bridge connection settings
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub login: u64,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub terminal_path: Option<String>,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// Keeps the password out of logs
impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("login", &self.login)
            .field("server", &self.server)
            .field("terminal_path", &self.terminal_path)
            .field("bridge_url", &self.bridge_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            login: 0,
            password: String::new(),
            server: String::new(),
            terminal_path: None,
            bridge_url: default_bridge_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_requests_per_second: default_max_requests_per_second(),
            max_retries: default_max_retries(),
        }
    }
}

impl BrokerConfig {
    /// Load from an optional JSON file, then overlay `FXBOT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Json));
        }
        let config = builder
            .add_source(Environment::with_prefix("FXBOT").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_reconnect_backoff_secs() -> Vec<u64> {
    vec![5, 30]
}

fn default_tick_timeout_secs() -> u64 {
    120
}

/// Run-loop pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Bounded run; `None` loops until interrupted
    #[serde(default)]
    pub iterations: Option<u64>,
    /// Waits between reconnect attempts; the last value repeats
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: Vec<u64>,
    /// Upper bound on a whole pipeline tick
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            iterations: None,
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            tick_timeout_secs: default_tick_timeout_secs(),
        }
    }
}

impl RunnerConfig {
    /// Short bounded run used by `--test-mode`
    pub fn test_mode(iterations: Option<u64>) -> Self {
        Self {
            poll_interval_secs: 5,
            iterations: Some(iterations.unwrap_or(3)),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs.max(1))
    }

    /// Wait before reconnect attempt `attempt` (0-based)
    pub fn reconnect_backoff(&self, attempt: usize) -> Duration {
        let secs = self
            .reconnect_backoff_secs
            .get(attempt)
            .or_else(|| self.reconnect_backoff_secs.last())
            .copied()
            .unwrap_or(30);
        Duration::from_secs(secs)
    }
}

/// Read a JSON strategy document, falling back to defaults when no path is given
pub fn load_json<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BotError::InvalidInput(format!("cannot read config {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Read a JSON strategy document as overrides of `base`.
///
/// Objects merge key by key, so a partial file keeps every field of the
/// preset it does not mention, nested policies included.
pub fn load_json_over<T>(path: Option<&Path>, base: T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let Some(path) = path else {
        return Ok(base);
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BotError::InvalidInput(format!("cannot read config {}: {e}", path.display()))
    })?;
    let overrides: Value = serde_json::from_str(&raw)?;
    let mut merged = serde_json::to_value(base)?;
    merge_json(&mut merged, overrides);
    Ok(serde_json::from_value(merged)?)
}

fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
