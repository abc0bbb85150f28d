//! Pool configuration via `tidepool.toml`
//!
//! All knobs the pool recognizes, loadable from a config file with
//! per-field defaults. Durations are stored in the units the options
//! have always used (minutes for ages, seconds for waits) with accessor
//! methods that convert to `Duration`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PoolError, Result};

/// Config file name, conventionally placed next to the service config.
pub const CONFIG_FILE_NAME: &str = "tidepool.toml";

/// How thoroughly a pooled connection is probed before being handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    /// No check at all
    None,
    /// Driver-level liveness only (closed flag + ping)
    Liveness,
    /// Liveness plus execution of the configured test statement
    TestStatement,
}

/// Configuration surface of one connection pool
///
/// # Example
///
/// ```toml
/// pool_min = 2
/// pool_max = 10          # 0 = no limit
/// check_level = 1        # 0 = none, 1 = liveness, 2 = liveness + test statement
/// max_age_minutes = 60
/// max_open_time_minutes = 10
/// max_wait_seconds = 30  # 0 = never wait
/// max_waiters = 32
/// pstmt_max = 16
/// sampling_period_seconds = 60
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Health-check level: 0 = none, 1 = liveness, 2 = liveness + test statement.
    #[serde(default = "default_check_level")]
    pub check_level: u8,
    /// Maximum age of a physical connection in minutes before it is
    /// eligible for eviction.
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: u64,
    /// Maximum time in minutes a connection may stay held without a
    /// bound transaction before it is considered leaked.
    #[serde(default = "default_max_open_time_minutes")]
    pub max_open_time_minutes: u64,
    /// SQL executed by level-2 health checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_statement: Option<String>,
    /// Prepared-statement cache capacity per physical connection.
    #[serde(default = "default_pstmt_max")]
    pub pstmt_max: usize,
    /// Target minimum number of open physical connections.
    #[serde(default)]
    pub pool_min: usize,
    /// Hard upper bound on open physical connections. 0 means no limit.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,
    /// How long an acquire may block waiting for capacity, in seconds.
    /// 0 disables waiting entirely.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Bound on the number of concurrently blocked acquire calls.
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,
    /// Period of the statistics sampling window, in seconds.
    #[serde(default = "default_sampling_period_seconds")]
    pub sampling_period_seconds: u64,
    /// Period of the background adjust pass, in seconds.
    #[serde(default = "default_adjust_period_seconds")]
    pub adjust_period_seconds: u64,
}

fn default_check_level() -> u8 {
    1
}

fn default_max_age_minutes() -> u64 {
    60
}

fn default_max_open_time_minutes() -> u64 {
    10
}

fn default_pstmt_max() -> usize {
    16
}

fn default_pool_max() -> usize {
    10
}

fn default_max_wait_seconds() -> u64 {
    30
}

fn default_max_waiters() -> usize {
    32
}

fn default_sampling_period_seconds() -> u64 {
    60
}

fn default_adjust_period_seconds() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            check_level: default_check_level(),
            max_age_minutes: default_max_age_minutes(),
            max_open_time_minutes: default_max_open_time_minutes(),
            test_statement: None,
            pstmt_max: default_pstmt_max(),
            pool_min: 0,
            pool_max: default_pool_max(),
            max_wait_seconds: default_max_wait_seconds(),
            max_waiters: default_max_waiters(),
            sampling_period_seconds: default_sampling_period_seconds(),
            adjust_period_seconds: default_adjust_period_seconds(),
        }
    }
}

impl PoolConfig {
    /// Parse the numeric check level into a `CheckLevel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the level is not 0, 1 or 2.
    pub fn check_level(&self) -> Result<CheckLevel> {
        match self.check_level {
            0 => Ok(CheckLevel::None),
            1 => Ok(CheckLevel::Liveness),
            2 => Ok(CheckLevel::TestStatement),
            other => Err(PoolError::Config(format!(
                "invalid check_level {} (expected 0, 1 or 2)",
                other
            ))),
        }
    }

    /// Upper bound on pool size, `None` when unlimited.
    pub fn pool_max_limit(&self) -> Option<usize> {
        if self.pool_max == 0 {
            None
        } else {
            Some(self.pool_max)
        }
    }

    /// Maximum connection age.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_minutes * 60)
    }

    /// Maximum open time before a held, untransacted connection counts
    /// as leaked.
    pub fn max_open_time(&self) -> Duration {
        Duration::from_secs(self.max_open_time_minutes * 60)
    }

    /// Maximum time an acquire may block. Zero means no waiting.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    /// Statistics sampling period.
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(self.sampling_period_seconds)
    }

    /// Background adjust period.
    pub fn adjust_period(&self) -> Duration {
        Duration::from_secs(self.adjust_period_seconds)
    }

    /// Validate internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        self.check_level()?;
        if let Some(max) = self.pool_max_limit() {
            if max < self.pool_min {
                return Err(PoolError::Config(format!(
                    "pool_max ({}) is below pool_min ({})",
                    max, self.pool_min
                )));
            }
        }
        if self.check_level == 2 && self.test_statement.is_none() {
            return Err(PoolError::Config(
                "check_level 2 requires a test_statement".to_string(),
            ));
        }
        if self.pstmt_max == 0 {
            return Err(PoolError::Config(
                "pstmt_max must be at least 1".to_string(),
            ));
        }
        if self.sampling_period_seconds == 0 {
            return Err(PoolError::Config(
                "sampling_period_seconds must be at least 1".to_string(),
            ));
        }
        if self.adjust_period_seconds == 0 {
            return Err(PoolError::Config(
                "adjust_period_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tidepool connection pool configuration
#
# pool_min: connections kept open even when idle (default: 0)
# pool_max: hard cap on open connections, 0 = no limit (default: 10)
pool_min = 0
pool_max = 10

# Health checking before hand-out:
#   0 = none, 1 = liveness probe, 2 = liveness + test statement
check_level = 1
# test_statement = "SELECT 1"

# Age and leak limits
max_age_minutes = 60
max_open_time_minutes = 10

# Waiting protocol: how long an acquire may block (0 = fail immediately)
# and how many callers may block at once.
max_wait_seconds = 30
max_waiters = 32

# Prepared-statement cache capacity per physical connection.
pstmt_max = 16

# Telemetry window and maintenance cadence.
sampling_period_seconds = 60
adjust_period_seconds = 30
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: PoolConfig = toml::from_str(&content).map_err(|e| {
            PoolError::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                PoolError::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
