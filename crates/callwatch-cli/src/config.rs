use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use callwatch_core::ReopenPolicy;
use callwatch_poller::{DEFAULT_FEED_URL, DEFAULT_FETCH_TIMEOUT, DEFAULT_INTERVAL};
use serde::Deserialize;

pub const DEFAULT_DB_PATH: &str = "./callwatch.sqlite3";
pub const ENV_FEED_URL: &str = "CALLWATCH_FEED_URL";
pub const ENV_INTERVAL_SECS: &str = "CALLWATCH_INTERVAL_SECS";

/// Optional TOML layer. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub feed_url: Option<String>,
    pub interval_secs: Option<u64>,
    /// `0` disables the fetch timeout.
    pub fetch_timeout_ms: Option<u64>,
    pub reopen_policy: Option<ReopenPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub feed_url: Option<String>,
    pub interval_secs: Option<String>,
}

impl EnvOverrides {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            feed_url: std::env::var(ENV_FEED_URL).ok(),
            interval_secs: std::env::var(ENV_INTERVAL_SECS).ok(),
        }
    }
}

/// Fully resolved runtime settings: defaults, then file, then environment,
/// then explicit flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub feed_url: String,
    pub interval: Duration,
    pub fetch_timeout: Option<Duration>,
    pub reopen_policy: ReopenPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            feed_url: DEFAULT_FEED_URL.to_string(),
            interval: DEFAULT_INTERVAL,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            reopen_policy: ReopenPolicy::default(),
        }
    }
}

impl Settings {
    pub fn resolve(config_path: Option<&Path>, db_override: Option<PathBuf>) -> Result<Self> {
        let file = match config_path {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        Self::from_layers(file, &EnvOverrides::from_env(), db_override)
    }

    pub fn from_layers(
        file: ConfigFile,
        env: &EnvOverrides,
        db_override: Option<PathBuf>,
    ) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(path) = file.db_path {
            settings.db_path = path;
        }
        if let Some(url) = file.feed_url {
            settings.feed_url = url;
        }
        if let Some(secs) = file.interval_secs {
            settings.interval = interval_from_secs(secs)?;
        }
        if let Some(ms) = file.fetch_timeout_ms {
            settings.fetch_timeout = timeout_from_ms(ms);
        }
        if let Some(policy) = file.reopen_policy {
            settings.reopen_policy = policy;
        }

        if let Some(url) = env.feed_url.as_deref().filter(|value| !value.trim().is_empty()) {
            settings.feed_url = url.trim().to_string();
        }
        if let Some(raw) = env.interval_secs.as_deref() {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_INTERVAL_SECS} must be an integer: {raw}"))?;
            settings.interval = interval_from_secs(secs)?;
        }

        if let Some(path) = db_override {
            settings.db_path = path;
        }

        Ok(settings)
    }
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn interval_from_secs(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(anyhow!("poll interval MUST be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

#[must_use]
pub fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
