use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::db::database_path;
use crate::organizer::PathTemplate;
use crate::watcher::{WatchSettings, WatchTarget};

/// Validated process settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub user_token: SecretString,
    pub data_path: PathBuf,
    /// Absolute watch roots; never empty.
    pub watch_dirs: Vec<PathBuf>,

    // Worker loop
    pub worker_poll_interval: Duration,
    pub worker_count: usize,
    pub worker_batch_size: u32,
    pub lease_duration: Duration,
    pub shutdown_grace: Duration,

    // Stage flags
    pub convert_epub: bool,
    pub delete_original_after_conversion: bool,
    pub embed_metadata: bool,
    pub fetch_external_metadata: bool,
    pub organize_library: bool,
    pub organize_template: PathTemplate,

    // Providers and tools
    pub amazon_domain: String,
    pub amazon_cookie: Option<SecretString>,
    pub provider_timeout: Duration,
    pub kepubify_path: PathBuf,
    pub convert_timeout: Duration,

    // Watcher
    pub watch_force_polling: bool,
    pub watch_poll_delay: Duration,
    pub watch_debounce: Duration,
}

pub(crate) mod defaults {
    pub const WORKER_POLL_INTERVAL_SECS: u64 = 5;
    pub const WORKER_COUNT: usize = 1;
    pub const WORKER_BATCH_SIZE: u32 = 4;
    pub const LEASE_DURATION_SECS: u64 = 900;
    pub const SHUTDOWN_GRACE_SECS: u64 = 30;
    pub const PROVIDER_TIMEOUT_SECS: u64 = 10;
    pub const CONVERT_TIMEOUT_SECS: u64 = 300;
    pub const WATCH_POLL_DELAY_MS: u64 = 300;
    pub const WATCH_DEBOUNCE_MS: u64 = 1000;
    pub const AMAZON_DOMAIN: &str = "com";
    pub const KEPUBIFY_PATH: &str = "kepubify";
    pub const ORGANIZE_TEMPLATE: &str = "{author}/{title}";
}

impl Config {
    /// Organized books land under the first watch directory.
    pub fn library_root(&self) -> &Path {
        // Validation guarantees at least one entry.
        self.watch_dirs.first().map(PathBuf::as_path).unwrap_or(Path::new("."))
    }

    pub fn database_path(&self) -> PathBuf {
        database_path(&self.data_path)
    }

    pub fn watch_targets(&self) -> Vec<WatchTarget> {
        self.watch_dirs
            .iter()
            .map(|dir| WatchTarget::new(dir.clone(), self.watch_force_polling))
            .collect()
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            debounce: self.watch_debounce,
            poll_delay: self.watch_poll_delay,
        }
    }
}

/// Platform data directory for the job database.
pub fn default_data_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("kobold"))
        .unwrap_or_else(|| PathBuf::from(".kobold"))
}
