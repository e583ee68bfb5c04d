use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;

use roomdrop_crypto::MasterSecret;
use roomdrop_store::Limits;
use roomdrop_store::policy::DEFAULT_DENIED_EXTENSIONS;

/// Placeholder secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "your-secure-encryption-key-2025",
];

/// Server configuration, read from `ROOMDROP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redacted in `Debug` output.
    pub secret: MasterSecret,
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_file_size: u64,
    pub max_room_size: u64,
    pub retention_hours: i64,
    pub max_message_len: usize,
    pub denied_extensions: Vec<String>,
    pub cleanup_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `from_env` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("ROOMDROP_SECRET").unwrap_or_default();
        if secret.is_empty() || PLACEHOLDER_SECRETS.contains(&secret.as_str()) {
            bail!("ROOMDROP_SECRET is unset or still a placeholder");
        }

        let denied_extensions = match lookup("ROOMDROP_DENIED_EXTENSIONS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_DENIED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        };

        let config = Self {
            secret: MasterSecret::new(secret),
            host: lookup("ROOMDROP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "ROOMDROP_PORT", 3300)?,
            storage_dir: lookup("ROOMDROP_STORAGE_DIR").unwrap_or_else(|| "./storage".into()).into(),
            db_path: lookup("ROOMDROP_DB_PATH").unwrap_or_else(|| "roomdrop.db".into()).into(),
            max_file_size: parse_or(&lookup, "ROOMDROP_MAX_FILE_SIZE", 100 * 1024 * 1024)?,
            max_room_size: parse_or(&lookup, "ROOMDROP_MAX_ROOM_SIZE", 1024 * 1024 * 1024)?,
            retention_hours: parse_or(&lookup, "ROOMDROP_RETENTION_HOURS", 24)?,
            max_message_len: parse_or(&lookup, "ROOMDROP_MAX_MESSAGE_LEN", 10_000)?,
            denied_extensions,
            cleanup_interval_secs: parse_or(&lookup, "ROOMDROP_CLEANUP_INTERVAL_SECS", 3600)?,
        };

        if config.retention_hours <= 0 {
            bail!("ROOMDROP_RETENTION_HOURS must be positive");
        }
        if config.cleanup_interval_secs == 0 {
            bail!("ROOMDROP_CLEANUP_INTERVAL_SECS must be positive");
        }
        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_file_size: self.max_file_size,
            max_room_size: self.max_room_size,
            retention: TimeDelta::hours(self.retention_hours),
            max_message_len: self.max_message_len,
            denied_extensions: self.denied_extensions.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(v) => v.trim().parse().with_context(|| format!("Invalid value for {}: {:?}", name, v)),
        None => Ok(default),
    }
}
