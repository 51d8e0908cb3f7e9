//! Runtime configuration for hosts embedding the follow graph core.
//!
//! # Responsibility
//! - Carry store tuning (`StoreOptions`) into connection bootstrap.
//! - Resolve host settings from `FOLLOWGRAPH_*` environment variables.
//!
//! # Invariants
//! - Missing variables fall back to documented defaults.
//! - Present but malformed variables are rejected, never silently ignored.

use crate::logging::default_log_level;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DB_PATH: &str = "FOLLOWGRAPH_DB_PATH";
pub const ENV_LOG_LEVEL: &str = "FOLLOWGRAPH_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "FOLLOWGRAPH_LOG_DIR";
pub const ENV_BUSY_TIMEOUT_MS: &str = "FOLLOWGRAPH_BUSY_TIMEOUT_MS";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-level tuning applied by `db::open_db_with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long SQLite waits on a competing writer before reporting busy.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Host configuration resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Database file. `None` means a private in-memory database.
    pub db_path: Option<PathBuf>,
    /// Log level passed to `init_logging`.
    pub log_level: String,
    /// Rolling log directory. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    pub store: StoreOptions,
}

impl CoreConfig {
    /// Reads configuration from process environment variables.
    ///
    /// # Errors
    /// - Returns an error string when a variable is set to a malformed value.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let busy_timeout = match non_empty(ENV_BUSY_TIMEOUT_MS) {
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|err| {
                    format!("{ENV_BUSY_TIMEOUT_MS} must be a non-negative integer, got `{raw}`: {err}")
                })?;
                Duration::from_millis(millis)
            }
            None => DEFAULT_BUSY_TIMEOUT,
        };

        let log_dir = non_empty(ENV_LOG_DIR).map(PathBuf::from);
        if let Some(dir) = log_dir.as_ref() {
            if !dir.is_absolute() {
                return Err(format!(
                    "{ENV_LOG_DIR} must be an absolute path, got `{}`",
                    dir.display()
                ));
            }
        }

        Ok(Self {
            db_path: non_empty(ENV_DB_PATH).map(PathBuf::from),
            log_level: non_empty(ENV_LOG_LEVEL)
                .unwrap_or_else(|| default_log_level().to_string()),
            log_dir,
            store: StoreOptions { busy_timeout },
        })
    }
}
