//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Credentials are wrapped in secrecy::SecretString to prevent log leaks.
//! Scheduler tuning lives in an optional TOML file named by
//! `AUDITQ_SETTINGS`; every field there has a default.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::SchedulerConfig;
use crate::error::{Error, Result};
use crate::store::DEFAULT_SHARD_MAX_BYTES;
use secrets::{Credential, parse_credentials};

#[derive(Debug)]
pub struct Config {
    pub credentials: Vec<Credential>,
    pub store_path: PathBuf,
    pub source_dir: PathBuf,
    /// Analyzer executable. Only `serve` needs it.
    pub analyzer: Option<PathBuf>,
    pub settings: Settings,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw = lookup("AUDITQ_CREDENTIALS").ok_or_else(|| missing("AUDITQ_CREDENTIALS"))?;
        let credentials = parse_credentials(&raw);
        if credentials.is_empty() {
            return Err(Error::Config(
                "AUDITQ_CREDENTIALS must list at least one credential".to_string(),
            ));
        }

        let (store_path, settings) = store_from_lookup(&lookup)?;

        Ok(Self {
            credentials,
            store_path,
            source_dir: lookup("AUDITQ_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources")),
            analyzer: lookup("AUDITQ_ANALYZER").map(PathBuf::from),
            settings,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn require_analyzer(&self) -> Result<&Path> {
        self.analyzer
            .as_deref()
            .ok_or_else(|| missing("AUDITQ_ANALYZER"))
    }
}

/// Store location and settings only. Read-side commands need no credentials.
pub fn store_from_env() -> Result<(PathBuf, Settings)> {
    store_from_lookup(&|name: &str| std::env::var(name).ok())
}

fn store_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<(PathBuf, Settings)> {
    let settings = match lookup("AUDITQ_SETTINGS") {
        Some(path) => Settings::load(Path::new(&path))?,
        None => Settings::default(),
    };
    let path = lookup("AUDITQ_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("audited.json"));
    Ok((path, settings))
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}

// ---------------------------------------------------------------------------
// Settings file
// ---------------------------------------------------------------------------

/// Scheduler tuning, in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub discovery_interval_ms: u64,
    /// Minimum gap between two dispatches on the same slot.
    pub min_delay_ms: u64,
    pub launch_stagger_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub transient_cooldown_ms: u64,
    /// Transient failures allowed before an item is given up on.
    pub max_attempts: u32,
    /// Bytes, not milliseconds.
    pub shard_max_bytes: u64,
    pub analyze_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 5_000,
            min_delay_ms: 1_000,
            launch_stagger_ms: 200,
            rate_limit_cooldown_ms: 60_000,
            transient_cooldown_ms: 5_000,
            max_attempts: 3,
            shard_max_bytes: DEFAULT_SHARD_MAX_BYTES,
            analyze_timeout_ms: 300_000,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.discovery_interval_ms == 0 {
            return Err(Error::Config(
                "discovery_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.shard_max_bytes == 0 {
            return Err(Error::Config("shard_max_bytes must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_millis(self.analyze_timeout_ms)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            launch_stagger: Duration::from_millis(self.launch_stagger_ms),
            rate_limit_cooldown: Duration::from_millis(self.rate_limit_cooldown_ms),
            transient_cooldown: Duration::from_millis(self.transient_cooldown_ms),
            max_attempts: self.max_attempts,
        }
    }
}
