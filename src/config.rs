use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_CONCURRENT: usize = 10;
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_ADMISSION_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Durations (de)serialize as integer milliseconds; missing fields take defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub concurrent: usize,
    /// Budget for one attempt. The transport is given this minus `timeout_margin`.
    #[serde(with = "duration_ms")]
    pub max_timeout: Duration,
    pub max_retries: usize,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub admission_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub timeout_margin: Duration,
    #[serde(with = "duration_ms")]
    pub backoff_step: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrent: DEFAULT_CONCURRENT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            admission_poll_interval: DEFAULT_ADMISSION_POLL_INTERVAL,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl DispatcherConfig {
    pub fn with_concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_admission_poll_interval(mut self, admission_poll_interval: Duration) -> Self {
        self.admission_poll_interval = admission_poll_interval;
        self
    }

    pub fn with_timeout_margin(mut self, timeout_margin: Duration) -> Self {
        self.timeout_margin = timeout_margin;
        self
    }

    pub fn with_backoff_step(mut self, backoff_step: Duration) -> Self {
        self.backoff_step = backoff_step;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.concurrent == 0 {
            return Err(Error::InvalidConfig {
                field: "concurrent",
                message: "must be >= 1",
            });
        }
        if self.max_timeout <= self.timeout_margin {
            return Err(Error::InvalidConfig {
                field: "max_timeout",
                message: "must be greater than timeout_margin",
            });
        }
        if self.admission_poll_interval.is_zero() {
            return Err(Error::InvalidConfig {
                field: "admission_poll_interval",
                message: "must be > 0",
            });
        }
        if self.backoff_step.is_zero() {
            return Err(Error::InvalidConfig {
                field: "backoff_step",
                message: "must be > 0",
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = value.as_millis().min(u64::MAX as u128) as u64;
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
