//! Batch override configuration.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_BATCH_ITEMS: usize = 10;
pub const DEFAULT_MAX_BATCH_OPEN: Duration = Duration::from_millis(200);

/// Limits that drive when a key's buffer is flushed and how much it may hold.
///
/// `max_batch_keys` and `max_buffer_size` default to `usize::MAX`, i.e. unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOverrideConfig {
    /// Flush as soon as a key's buffer holds this many entries.
    pub max_batch_items: usize,
    /// Flush a non-full buffer this long after its first entry arrived.
    #[serde(rename = "max_batch_open_in_ms", with = "duration_ms")]
    pub max_batch_open: Duration,
    /// Cap on distinct batch keys tracked by one manager.
    pub max_batch_keys: usize,
    /// Cap on unflushed entries per key.
    pub max_buffer_size: usize,
}

impl Default for BatchOverrideConfig {
    fn default() -> Self {
        Self {
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            max_batch_open: DEFAULT_MAX_BATCH_OPEN,
            max_batch_keys: usize::MAX,
            max_buffer_size: usize::MAX,
        }
    }
}

impl BatchOverrideConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_items(mut self, n: usize) -> Self {
        self.max_batch_items = n;
        self
    }

    pub fn with_max_batch_open(mut self, d: Duration) -> Self {
        self.max_batch_open = d;
        self
    }

    pub fn with_max_batch_keys(mut self, n: usize) -> Self {
        self.max_batch_keys = n;
        self
    }

    pub fn with_max_buffer_size(mut self, n: usize) -> Self {
        self.max_buffer_size = n;
        self
    }

    /// Defaults overridden by `SDK_BATCH_*` environment variables.
    ///
    /// Unset or unparseable variables keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_batch_items: env_usize("SDK_BATCH_MAX_ITEMS").unwrap_or(defaults.max_batch_items),
            max_batch_open: env::var("SDK_BATCH_MAX_OPEN_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_batch_open),
            max_batch_keys: env_usize("SDK_BATCH_MAX_KEYS").unwrap_or(defaults.max_batch_keys),
            max_buffer_size: env_usize("SDK_BATCH_MAX_BUFFER_SIZE")
                .unwrap_or(defaults.max_buffer_size),
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid batch configuration: {}", e),
                ErrorContext::new().with_source("batch_config"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid batch configuration: {}", e),
                ErrorContext::new().with_source("batch_config"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Every limit must be positive.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("max_batch_items", self.max_batch_items == 0),
            ("max_batch_open_in_ms", self.max_batch_open.is_zero()),
            ("max_batch_keys", self.max_batch_keys == 0),
            ("max_buffer_size", self.max_buffer_size == 0),
        ];
        for (field, invalid) in checks {
            if invalid {
                return Err(Error::configuration_with_context(
                    "value must be positive",
                    ErrorContext::new()
                        .with_field_path(field)
                        .with_source("batch_config"),
                ));
            }
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
