use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_MUTEX_TTL_IN_SECS: i64 = 10;
pub const DEFAULT_MUTEX_TTL_IN_SECS: i64 = 5 * 60;
pub const MIN_MUTEX_WAIT_TIME_IN_SECS: i64 = 1;
pub const DEFAULT_MUTEX_WAIT_TIME_IN_SECS: i64 = 10;
/// Must be greater than the TTL.
pub const MIN_MUTEX_STALENESS_IN_SECS: i64 = MIN_MUTEX_TTL_IN_SECS + 1;
pub const DEFAULT_MUTEX_STALENESS_IN_SECS: i64 = 2 * DEFAULT_MUTEX_TTL_IN_SECS;
pub const MIN_MUTEX_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MUTEX_MAX_RETRIES: u32 = 50;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid mutex config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("'{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("'{field}' is {value} but must be at least {min}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
    },

    #[error(
        "staleness ({staleness}s) must be higher than the maximum of the TTL ({ttl}s) \
         and the retry window ({max_retries} retries x {wait_time}s wait = {retry_window}s)"
    )]
    StalenessTooLow {
        staleness: i64,
        ttl: i64,
        wait_time: i64,
        max_retries: u32,
        retry_window: i64,
    },
}

/// Configuration of one mutex, shared by every client of it.
///
/// All clients of the same mutex must agree on `mutex_uuid` and the
/// Spanner coordinates; the timing knobs should also match so that the
/// clients reason about leases consistently.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MutexConfig {
    /// The key to the mutex, each mutex has its own UUID.
    /// It must be the same for all clients.
    pub mutex_uuid: Uuid,
    /// Spanner instance ID.
    pub instance_id: String,
    /// Spanner database ID, hosted by the instance.
    pub database_id: String,
    /// Spanner table holding the mutex rows, within the database.
    pub table_id: String,
    /// Google Cloud project, if not the default one.
    #[serde(default)]
    pub project_id: Option<String>,
    /// No functional need, just makes displaying and debugging easier.
    #[serde(default)]
    pub mutex_display_name: Option<String>,
    /// Time the acquiring client has to execute the critical section.
    /// Once breached (plus jitter), abandoned failed/unknown states can
    /// be taken over by other clients.
    #[serde(default = "default_ttl")]
    pub mutex_ttl_in_secs: i64,
    /// Sleep between acquisition cycles when the mutex could not be
    /// acquired.
    #[serde(default = "default_wait_time")]
    pub mutex_wait_time_in_secs: i64,
    /// Any state older than this is assumed to be from a past execution
    /// and ignored, whatever its status.
    #[serde(default = "default_staleness")]
    pub mutex_staleness_in_secs: i64,
    /// Give up after this many unsuccessful acquisition cycles.
    #[serde(default = "default_max_retries")]
    pub mutex_max_retries: u32,
}

fn default_ttl() -> i64 {
    DEFAULT_MUTEX_TTL_IN_SECS
}

fn default_wait_time() -> i64 {
    DEFAULT_MUTEX_WAIT_TIME_IN_SECS
}

fn default_staleness() -> i64 {
    DEFAULT_MUTEX_STALENESS_IN_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MUTEX_MAX_RETRIES
}

impl MutexConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(content: &str) -> Result<MutexConfig, ConfigError> {
        let config: MutexConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<MutexConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Checks field bounds and the relation between staleness, TTL and
    /// the retry window. Staleness must be higher than both, otherwise
    /// clients would treat rows written during a normal retry cycle as
    /// abandoned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.instance_id, "instance_id")?;
        require_non_empty(&self.database_id, "database_id")?;
        require_non_empty(&self.table_id, "table_id")?;
        if let Some(project_id) = &self.project_id {
            require_non_empty(project_id, "project_id")?;
        }
        require_at_least(self.mutex_ttl_in_secs, MIN_MUTEX_TTL_IN_SECS, "mutex_ttl_in_secs")?;
        require_at_least(
            self.mutex_wait_time_in_secs,
            MIN_MUTEX_WAIT_TIME_IN_SECS,
            "mutex_wait_time_in_secs",
        )?;
        require_at_least(
            self.mutex_staleness_in_secs,
            MIN_MUTEX_STALENESS_IN_SECS,
            "mutex_staleness_in_secs",
        )?;
        require_at_least(
            self.mutex_max_retries as i64,
            MIN_MUTEX_MAX_RETRIES as i64,
            "mutex_max_retries",
        )?;

        let retry_window = self.mutex_max_retries as i64 * self.mutex_wait_time_in_secs;
        let max_active = retry_window.max(self.mutex_ttl_in_secs);
        if self.mutex_staleness_in_secs <= max_active {
            return Err(ConfigError::StalenessTooLow {
                staleness: self.mutex_staleness_in_secs,
                ttl: self.mutex_ttl_in_secs,
                wait_time: self.mutex_wait_time_in_secs,
                max_retries: self.mutex_max_retries,
                retry_window,
            });
        }
        Ok(())
    }

    /// Display name of the mutex, falling back to its UUID.
    pub fn display_name(&self) -> String {
        self.mutex_display_name
            .clone()
            .unwrap_or_else(|| self.mutex_uuid.to_string())
    }
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyField(field));
    }
    Ok(())
}

fn require_at_least(value: i64, min: i64, field: &'static str) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange { field, value, min });
    }
    Ok(())
}
