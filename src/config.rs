//! Ledger configuration
//!
//! Loaded from an optional `audit-ledger.toml` file and then from
//! `AUDIT_LEDGER__*` environment variables (`__` separates nested keys,
//! e.g. `AUDIT_LEDGER__KEYS__EVENT_KEY`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LedgerError, LedgerResult};

/// Minimum accepted length for either signing key.
pub const MIN_KEY_LENGTH: usize = 32;

const DEFAULT_CONFIG_FILE: &str = "audit-ledger";
const ENV_PREFIX: &str = "AUDIT_LEDGER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub keys: KeyConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Secret material. Kept out of `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub event_key: String,
    pub checkpoint_key: String,
}

impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("event_key", &"<redacted>")
            .field("checkpoint_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Attempts per `record` call across conflicts and storage transients.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Default deadline for acquiring an allocation.
    pub timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 5,
            max_backoff_ms: 500,
            timeout_ms: 5_000,
        }
    }
}

impl WriterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Seal after this many new events...
    pub every_events: u64,
    /// ...or after this long since the last checkpoint, whichever comes first.
    pub interval_secs: u64,
    /// How often the background scheduler evaluates the triggers.
    pub poll_interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_events: 100,
            interval_secs: 3_600,
            poll_interval_secs: 30,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

fn default_database_url() -> String {
    "sqlite://audit-ledger.db".to_string()
}

impl LedgerConfig {
    /// Build a config with defaults everywhere except the keys.
    pub fn new(event_key: impl Into<String>, checkpoint_key: impl Into<String>) -> Self {
        Self {
            database_url: default_database_url(),
            keys: KeyConfig {
                event_key: event_key.into(),
                checkpoint_key: checkpoint_key.into(),
            },
            writer: WriterConfig::default(),
            checkpoint: CheckpointConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Load from `audit-ledger.toml` (if present) and the environment.
    pub fn load() -> LedgerResult<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from the given file stem/path (optional) and the environment.
    pub fn load_from(path: &Path) -> LedgerResult<Self> {
        info!("Loading ledger configuration from {:?} and environment", path);

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: LedgerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the ledger cannot run safely with.
    pub fn validate(&self) -> LedgerResult<()> {
        validate_key("event_key", &self.keys.event_key)?;
        validate_key("checkpoint_key", &self.keys.checkpoint_key)?;

        if self.keys.event_key == self.keys.checkpoint_key {
            return Err(LedgerError::Config(
                "event_key and checkpoint_key must differ".to_string(),
            ));
        }

        if self.writer.max_attempts == 0 {
            return Err(LedgerError::Config(
                "writer.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.writer.base_backoff_ms > self.writer.max_backoff_ms {
            return Err(LedgerError::Config(format!(
                "writer.base_backoff_ms ({}) > writer.max_backoff_ms ({})",
                self.writer.base_backoff_ms, self.writer.max_backoff_ms
            )));
        }

        if self.checkpoint.every_events == 0 {
            return Err(LedgerError::Config(
                "checkpoint.every_events must be at least 1".to_string(),
            ));
        }

        if self.checkpoint.poll_interval_secs == 0 {
            return Err(LedgerError::Config(
                "checkpoint.poll_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_key(name: &str, value: &str) -> LedgerResult<()> {
    if value.len() < MIN_KEY_LENGTH {
        return Err(LedgerError::Config(format!(
            "{} must be at least {} characters",
            name, MIN_KEY_LENGTH
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_KEY: &str = "event-key-0123456789abcdef0123456789";
    const CHECKPOINT_KEY: &str = "checkpoint-key-0123456789abcdef012345";

    #[test]
    fn test_defaults_validate() {
        let config = LedgerConfig::new(EVENT_KEY, CHECKPOINT_KEY);
        assert!(config.validate().is_ok());
        assert_eq!(config.checkpoint.every_events, 100);
        assert_eq!(config.writer.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_short_key_rejected() {
        let config = LedgerConfig::new("short", CHECKPOINT_KEY);
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_identical_keys_rejected() {
        let config = LedgerConfig::new(EVENT_KEY, EVENT_KEY);
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let mut config = LedgerConfig::new(EVENT_KEY, CHECKPOINT_KEY);
        config.writer.base_backoff_ms = 1_000;
        config.writer.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = LedgerConfig::new(EVENT_KEY, CHECKPOINT_KEY);
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(EVENT_KEY));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(
            &path,
            format!(
                "database_url = \"sqlite::memory:\"\n\
                 [keys]\nevent_key = \"{}\"\ncheckpoint_key = \"{}\"\n\
                 [checkpoint]\nevery_events = 10\n",
                EVENT_KEY, CHECKPOINT_KEY
            ),
        )
        .unwrap();

        let config = LedgerConfig::load_from(&path).unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.checkpoint.every_events, 10);
        assert_eq!(config.checkpoint.interval_secs, 3_600);
        assert_eq!(config.writer.max_attempts, 8);
    }
}
