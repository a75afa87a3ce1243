use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use super::schema::{default_data_path, defaults, Config};
use crate::error::ConfigError;
use crate::organizer::PathTemplate;

impl Config {
    /// Reads settings from the process environment. Call `dotenvy::dotenv()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Parses and validates settings from explicit key/value pairs.
    /// Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = Vars(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(_, v)| !v.trim().is_empty())
                .collect(),
        );

        let user_token = vars
            .get("USER_TOKEN")
            .map(|token| SecretString::from(token.to_string()))
            .ok_or(ConfigError::Missing { key: "USER_TOKEN" })?;

        let config = Config {
            user_token,
            data_path: vars
                .get("DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_path),
            watch_dirs: watch_dirs(vars.get("WATCH_DIRS"))?,

            worker_poll_interval: vars.secs(
                "WORKER_POLL_INTERVAL",
                defaults::WORKER_POLL_INTERVAL_SECS,
            )?,
            worker_count: vars.parse("WORKER_COUNT", defaults::WORKER_COUNT)?,
            worker_batch_size: vars.parse("WORKER_BATCH_SIZE", defaults::WORKER_BATCH_SIZE)?,
            lease_duration: vars.secs("LEASE_DURATION", defaults::LEASE_DURATION_SECS)?,
            shutdown_grace: vars.secs("SHUTDOWN_GRACE", defaults::SHUTDOWN_GRACE_SECS)?,

            convert_epub: vars.flag("CONVERT_EPUB", true)?,
            delete_original_after_conversion: vars
                .flag("DELETE_ORIGINAL_AFTER_CONVERSION", false)?,
            embed_metadata: vars.flag("EMBED_METADATA", true)?,
            fetch_external_metadata: vars.flag("FETCH_EXTERNAL_METADATA", true)?,
            organize_library: vars.flag("ORGANIZE_LIBRARY", false)?,
            organize_template: PathTemplate::parse(
                vars.get("ORGANIZE_TEMPLATE")
                    .unwrap_or(defaults::ORGANIZE_TEMPLATE),
            )?,

            amazon_domain: vars
                .get("AMAZON_DOMAIN")
                .unwrap_or(defaults::AMAZON_DOMAIN)
                .trim()
                .trim_start_matches('.')
                .to_string(),
            amazon_cookie: vars
                .get("AMAZON_COOKIE")
                .map(|cookie| SecretString::from(cookie.to_string())),
            provider_timeout: vars.secs("PROVIDER_TIMEOUT", defaults::PROVIDER_TIMEOUT_SECS)?,
            kepubify_path: vars
                .get("KEPUBIFY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(defaults::KEPUBIFY_PATH)),
            convert_timeout: vars.secs("CONVERT_TIMEOUT", defaults::CONVERT_TIMEOUT_SECS)?,

            watch_force_polling: vars.flag("WATCH_FORCE_POLLING", false)?,
            watch_poll_delay: vars.millis("WATCH_POLL_DELAY_MS", defaults::WATCH_POLL_DELAY_MS)?,
            watch_debounce: vars.millis("WATCH_DEBOUNCE_MS", defaults::WATCH_DEBOUNCE_MS)?,
        };

        validate_config(&config)?;
        Ok(config)
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true/false, 1/0, yes/no or on/off".to_string(),
        })
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn watch_dirs(raw: Option<&str>) -> Result<Vec<PathBuf>, ConfigError> {
    let raw = raw.ok_or(ConfigError::Missing { key: "WATCH_DIRS" })?;
    let mut dirs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let dir = std::path::absolute(entry).map_err(|e| ConfigError::InvalidValue {
            key: "WATCH_DIRS",
            value: entry.to_string(),
            reason: e.to_string(),
        })?;
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    Ok(dirs)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.watch_dirs.is_empty() {
        return Err(ConfigError::Validation {
            message: "WATCH_DIRS must name at least one directory".to_string(),
        });
    }
    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "WORKER_COUNT must be at least 1".to_string(),
        });
    }
    if config.worker_batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "WORKER_BATCH_SIZE must be at least 1".to_string(),
        });
    }
    let positive = [
        ("LEASE_DURATION", config.lease_duration),
        ("WORKER_POLL_INTERVAL", config.worker_poll_interval),
        ("WATCH_DEBOUNCE_MS", config.watch_debounce),
        ("WATCH_POLL_DELAY_MS", config.watch_poll_delay),
    ];
    if let Some((key, _)) = positive.iter().find(|(_, d)| d.is_zero()) {
        return Err(ConfigError::Validation {
            message: format!("{} must be positive", key),
        });
    }
    if config.amazon_domain.is_empty() {
        return Err(ConfigError::Validation {
            message: "AMAZON_DOMAIN may not be blank".to_string(),
        });
    }
    Ok(())
}
