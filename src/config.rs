//! Configuration loading.
//!
//! A JSON file holds server and client options; every field is optional and
//! falls back to the defaults in [`crate::constants`]. Environment variables
//! override the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::ClientOptions;
use crate::constants::DEFAULT_LISTEN_ADDR;
use crate::server::ServerOptions;
use crate::session::ErrorMode;

/// Configuration for the `topicwire` binary and embedders.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Settings applied to every accepted connection.
    pub server: ServerOptions,
    /// Settings for outgoing connections.
    pub client: ClientOptions,
    /// Address `serve` listens on.
    pub listen_addr: String,
    /// URL `listen` connects to.
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            client: ClientOptions::default(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            url: format!("ws://{DEFAULT_LISTEN_ADDR}"),
        }
    }
}

impl Config {
    /// Defaults plus environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Read `path`, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `TOPICWIRE_*` overrides read through `lookup`. Unparseable
    /// values are ignored with a warning.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_var::<u64>(&lookup, "TOPICWIRE_PING_INTERVAL_MS") {
            // Zero disables server pings.
            self.server.ping_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(base) = parse_var::<f64>(&lookup, "TOPICWIRE_RETRY_BASE") {
            // Below 1 the delays would shrink between attempts.
            if base.is_finite() && base >= 1.0 {
                self.client.backoff.base = base;
            } else {
                log::warn!("[Config] Ignoring TOPICWIRE_RETRY_BASE={}: must be at least 1", base);
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "TOPICWIRE_RETRY_MAX_MS") {
            self.client.backoff.max_delay = Duration::from_millis(ms);
        }

        if let Some(limit) = parse_var::<u32>(&lookup, "TOPICWIRE_GIVE_UP_AFTER") {
            self.client.backoff.give_up_after = Some(limit);
        }

        if let Some(mode) = lookup("TOPICWIRE_ERROR_MODE") {
            match mode.as_str() {
                "strict" => self.set_error_mode(ErrorMode::Strict),
                "lenient" => self.set_error_mode(ErrorMode::Lenient),
                other => log::warn!("[Config] Ignoring TOPICWIRE_ERROR_MODE={}", other),
            }
        }

        if let Some(addr) = lookup("TOPICWIRE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Some(url) = lookup("TOPICWIRE_URL") {
            self.url = url;
        }
    }

    fn set_error_mode(&mut self, mode: ErrorMode) {
        self.server.error_mode = mode;
        self.client.error_mode = mode;
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring {}={}: not a valid value", name, raw);
            None
        }
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde adapter storing an optional [`Duration`] as milliseconds or `null`.
pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds or `null`.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::duration_ms::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from milliseconds or `null`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
