//! Materialization settings: where library images are written and how hard the
//! writer retries. Defaults, then an optional JSON file, then env overrides.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DIR_ENV: &str = "TEMPDYLIB_DIR";
pub const RETRIES_ENV: &str = "TEMPDYLIB_RETRIES";
pub const RETRY_DELAY_ENV: &str = "TEMPDYLIB_RETRY_DELAY_MS";

pub const DEFAULT_RETRIES: u32 = 60;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bounds for the verify-then-write loop in [`crate::files::safe_write_file`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra rounds beyond the mandatory read, write, re-read sequence.
    pub retries: u32,
    /// Pause between rounds.
    #[serde(with = "duration_ms", rename = "delay_ms")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Index of the final round. Rounds run `0..=last_round()`.
    pub fn last_round(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Total number of read attempts the loop may make.
    pub fn max_attempts(&self) -> u32 {
        self.last_round().saturating_add(1)
    }
}

/// Settings shared by every library created with them. Passed in explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for materialized images; the platform temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Config {
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }

    /// Defaults overridden by `TEMPDYLIB_DIR`, `TEMPDYLIB_RETRIES` and
    /// `TEMPDYLIB_RETRY_DELAY_MS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = env::var(DIR_ENV) {
            if !dir.trim().is_empty() {
                self.temp_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(r) = env::var(RETRIES_ENV).ok().and_then(|v| v.trim().parse().ok()) {
            self.retry.retries = r;
        }
        if let Some(ms) = env::var(RETRY_DELAY_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.retry.delay = Duration::from_millis(ms);
        }
        self
    }
}

/// Load config from a JSON file, then apply env overrides.
/// Missing or invalid file = default.
pub fn load_config(path: &Path) -> Config {
    let from_file = if path.is_file() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<Config>(&s).ok())
    } else {
        None
    };
    from_file.unwrap_or_default().apply_env()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
