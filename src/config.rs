//! Configuration types for batch-fetch

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fetch engine configuration
///
/// Passed explicitly to [`FetchEngine::new`](crate::FetchEngine::new); nothing is read
/// from process-wide state. Every field has a default, so partial JSON/TOML documents
/// deserialize cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Number of concurrent workers (default: 5)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause each worker takes after finishing a unit of work (default: 0)
    ///
    /// Workers pace independently, so effective throughput is
    /// `concurrency / inter_delay` units per second.
    #[serde(default, with = "duration_serde")]
    pub inter_delay: Duration,

    /// Capacity of the shared work queue (default: None = same as `concurrency`)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Retry behavior for individual identifiers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Deadline for the whole batch (default: 600 seconds)
    #[serde(default = "default_global_timeout", with = "duration_serde")]
    pub global_timeout: Duration,

    /// What to return when some identifiers fail (default: fail fast)
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Settings for the built-in HTTP retriever
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            inter_delay: Duration::ZERO,
            queue_capacity: None,
            retry: RetryConfig::default(),
            global_timeout: default_global_timeout(),
            failure_policy: FailurePolicy::default(),
            http: HttpConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Check the configuration for values that would make a batch hang or never run
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config(
                "concurrency",
                "concurrency must be at least 1 (no worker would ever drain the queue)",
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(Error::config(
                "queue_capacity",
                "queue capacity must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "retry.max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        if self.global_timeout.is_zero() {
            return Err(Error::config(
                "global_timeout",
                "global timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Effective capacity of the work queue
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.concurrency).max(1)
    }
}

/// Retry configuration for a single identifier
///
/// Backoff is linear: after failed attempt `n` the worker waits `n * backoff_step`
/// (2s, 4s, 6s, … with the default step) before trying again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts per identifier, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit multiplied by the attempt number (default: 2 seconds)
    #[serde(default = "default_backoff_step", with = "duration_serde")]
    pub backoff_step: Duration,

    /// Upper bound for a single backoff sleep (default: None = uncapped)
    #[serde(default, with = "optional_duration_serde")]
    pub max_delay: Option<Duration>,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,

    /// Retry failures the remote side blames on the request, such as 404 or an
    /// unparsable URL (default: true)
    ///
    /// When false those failures end the retry loop after the first attempt.
    #[serde(default = "default_true")]
    pub retry_client_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step: default_backoff_step(),
            max_delay: None,
            jitter: false,
            retry_client_errors: true,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_step.saturating_mul(attempt);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// How a batch resolves when some identifiers failed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failure turns the whole batch into an error and successes are discarded (default)
    #[default]
    FailFast,
    /// Return successes together with the list of failures
    BestEffort,
}

/// Settings for [`HttpRetriever`](crate::retriever::HttpRetriever)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Proxy URL applied to all requests (default: None)
    #[serde(default)]
    pub proxy: Option<String>,

    /// Timeout for a single request (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header (default: "batch-fetch/<version>")
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    5
}

fn default_global_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_step() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("batch-fetch/", env!("CARGO_PKG_VERSION")).to_string()
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
