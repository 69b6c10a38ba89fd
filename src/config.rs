//! Pipeline configuration
//!
//! Configuration for the scheduler, search executor, result aggregator and
//! session store. One [`PipelineConfig`] value is built at startup and handed to
//! each component at construction; nothing reads process-wide state afterwards.
//!
//! Values can come from defaults, a JSON file, or environment variables
//! (a `.env` file is loaded first when present).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default directory for session documents
pub const DEFAULT_DATA_DIR: &str = "research_data";

/// Retry policy for transient search failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first call
    pub max_retries: usize,

    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set backoff base duration
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum backoff duration
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Calculate delay for a given retry attempt (exponential backoff)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_max)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, retries: usize) -> bool {
        retries < self.max_retries
    }

    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Batch scheduling options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Maximum concurrent search executions
    pub concurrency: usize,

    /// Delay applied before a task competes for a concurrency slot
    #[serde(with = "humantime_serde")]
    pub launch_delay: Duration,

    /// Timeout for one task, covering all of its retry attempts
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Timeout for the whole batch
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Cancel the rest of the batch after a fatal provider error
    pub halt_on_fatal: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            launch_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(60),
            batch_timeout: Duration::from_secs(300),
            halt_on_fatal: true,
        }
    }
}

impl SchedulerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_halt_on_fatal(mut self, halt: bool) -> Self {
        self.halt_on_fatal = halt;
        self
    }
}

/// Search executor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Timeout for a single call to the search capability
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Query text longer than this is shortened before dispatch
    pub max_query_chars: usize,

    pub retry: RetryPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_query_chars: 200,
            retry: RetryPolicy::default(),
        }
    }
}

/// Content size limits, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLimits {
    pub max_result_chars: usize,
    pub max_total_chars: usize,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_result_chars: 50_000,
            max_total_chars: 400_000,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding one JSON document per session
    pub data_dir: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerOptions,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub limits: ContentLimits,

    /// Timeout for one question or plan generation call
    #[serde(default = "default_generation_timeout", with = "humantime_serde")]
    pub generation_timeout: Duration,

    /// Timeout for consuming the whole report stream
    #[serde(default = "default_report_timeout", with = "humantime_serde")]
    pub report_timeout: Duration,
}

fn default_generation_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_report_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            scheduler: SchedulerOptions::default(),
            search: SearchConfig::default(),
            limits: ContentLimits::default(),
            generation_timeout: default_generation_timeout(),
            report_timeout: default_report_timeout(),
        }
    }
}

impl PipelineConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing sections take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RESEARCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&lookup, "RESEARCH_CONCURRENCY")? {
            self.scheduler.concurrency = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_LAUNCH_DELAY")? {
            self.scheduler.launch_delay = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_TASK_TIMEOUT")? {
            self.scheduler.task_timeout = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_BATCH_TIMEOUT")? {
            self.scheduler.batch_timeout = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_CALL_TIMEOUT")? {
            self.search.call_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "RESEARCH_MAX_RETRIES")? {
            self.search.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "RESEARCH_MAX_RESULT_CHARS")? {
            self.limits.max_result_chars = v;
        }
        if let Some(v) = parse_var(&lookup, "RESEARCH_MAX_TOTAL_CHARS")? {
            self.limits.max_total_chars = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_GENERATION_TIMEOUT")? {
            self.generation_timeout = v;
        }
        if let Some(v) = duration_var(&lookup, "RESEARCH_REPORT_TIMEOUT")? {
            self.report_timeout = v;
        }
        Ok(())
    }

    /// Validate the configuration before any component is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.scheduler.task_timeout.is_zero() {
            return Err(ConfigError::invalid("task_timeout", "must be non-zero"));
        }
        if self.scheduler.batch_timeout < self.scheduler.task_timeout {
            return Err(ConfigError::invalid(
                "batch_timeout",
                "must not be shorter than task_timeout",
            ));
        }
        if self.search.max_query_chars == 0 {
            return Err(ConfigError::invalid("max_query_chars", "must be at least 1"));
        }
        if self.limits.max_result_chars == 0 || self.limits.max_total_chars == 0 {
            return Err(ConfigError::invalid("limits", "content limits must be non-zero"));
        }
        if self.generation_timeout.is_zero() {
            return Err(ConfigError::invalid("generation_timeout", "must be non-zero"));
        }
        if self.report_timeout.is_zero() {
            return Err(ConfigError::invalid("report_timeout", "must be non-zero"));
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_scheduler(mut self, options: SchedulerOptions) -> Self {
        self.scheduler = options;
        self
    }

    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.search.retry = policy;
        self
    }

    pub fn with_limits(mut self, limits: ContentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        None => Ok(None),
    }
}

fn duration_var<F>(lookup: &F, name: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => humantime_serde::re::humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, e.to_string())),
        None => Ok(None),
    }
}
