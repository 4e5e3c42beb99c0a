//! Configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default IMAP server (iCloud Mail).
pub const DEFAULT_IMAP_HOST: &str = "imap.mail.me.com";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Period between poll cycles.
    pub poll_interval: Duration,
    /// Deadline applied to every remote mail-store call.
    pub imap_timeout: Duration,
    pub web_port: u16,
    pub db_path: PathBuf,
    /// Snapshots older than this many days are purged. `0` disables the purge.
    pub snapshot_retention_days: u32,
    /// Optional directory for a daily rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username =
            get("ICLOUD_EMAIL").ok_or_else(|| ConfigError::MissingEnvVar("ICLOUD_EMAIL".into()))?;
        let password = get("ICLOUD_APP_PASSWORD")
            .ok_or_else(|| ConfigError::MissingEnvVar("ICLOUD_APP_PASSWORD".into()))?;

        let imap_host = get("IMAP_HOST").unwrap_or_else(|| DEFAULT_IMAP_HOST.to_string());
        let imap_port = parse_or("IMAP_PORT", get("IMAP_PORT"), 993u16)?;

        let poll_secs = parse_or("POLL_INTERVAL_SECS", get("POLL_INTERVAL_SECS"), 60u64)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        let timeout_secs = parse_or("IMAP_TIMEOUT_SECS", get("IMAP_TIMEOUT_SECS"), 60u64)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "IMAP_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let web_port = parse_or("WEB_PORT", get("WEB_PORT"), 8080u16)?;
        let db_path = get("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/data/postal.db"));
        let snapshot_retention_days = parse_or(
            "SNAPSHOT_RETENTION_DAYS",
            get("SNAPSHOT_RETENTION_DAYS"),
            30u32,
        )?;

        Ok(Self {
            imap_host,
            imap_port,
            username,
            password: SecretString::from(password),
            poll_interval: Duration::from_secs(poll_secs),
            imap_timeout: Duration::from_secs(timeout_secs),
            web_port,
            db_path,
            snapshot_retention_days,
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(s) => s.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{s:?}: {e}"),
        }),
    }
}
