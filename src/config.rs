use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limiter::RateLimits;
use crate::types::FailureKind;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory scanned (recursively) for images to classify
    #[arg(env = "TARGET_DIR")]
    pub target_dir: PathBuf,

    /// CSV ledger holding completed classifications
    #[arg(long, env = "LEDGER_PATH", default_value = "classifications.csv")]
    pub ledger: PathBuf,

    /// Published per-minute request ceiling of the API
    #[arg(long, env = "PER_MINUTE_CEILING", default_value = "15")]
    pub per_minute_ceiling: u32,

    /// Published per-day request ceiling of the API
    #[arg(long, env = "PER_DAY_CEILING", default_value = "1500")]
    pub per_day_ceiling: u32,

    /// Fraction of each ceiling held back as headroom
    #[arg(long, env = "SAFETY_MARGIN", default_value = "0.1")]
    pub safety_margin: f64,

    /// What to do with items whose failure may be transient
    #[arg(long, env = "ON_FAILURE", value_enum, default_value_t = OnFailure::RetryNextRun)]
    pub on_failure: OnFailure,

    /// Longest rate-limit wait accepted before the run stops dispatching
    #[arg(long, env = "MAX_WAIT_SECS", default_value = "600")]
    pub max_wait_secs: u64,

    /// Number of items classified concurrently
    #[arg(long, env = "WORKERS", default_value = "1")]
    pub workers: usize,

    /// Process at most this many pending items in this run
    #[arg(long, env = "LIMIT")]
    pub limit: Option<usize>,

    /// Pause applied after the API reports a rate limit
    #[arg(long, env = "RATE_LIMIT_BACKOFF_SECS", default_value = "60")]
    pub rate_limit_backoff_secs: u64,

    /// Times an item is retried within a run after a rate-limit response
    #[arg(long, env = "RATE_LIMIT_RETRIES", default_value = "3")]
    pub rate_limit_retries: u32,

    /// Gemini API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Gemini model used for classification
    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-1.5-flash")]
    pub model: String,

    /// Base URL of the Generative Language API
    #[arg(
        long,
        env = "GEMINI_API_BASE",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub api_base: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "60")]
    pub request_timeout_secs: u64,

    /// Number of primary styles listed in the end-of-run summary
    #[arg(long, env = "SUMMARY_TOP", default_value = "10")]
    pub summary_top: usize,

    /// Write the primary style distribution to this CSV file
    #[arg(long, env = "ANALYSIS_OUTPUT")]
    pub analysis_output: Option<PathBuf>,

    /// Expose Prometheus metrics on this address while the run is active
    #[arg(long, env = "METRICS_ADDRESS")]
    pub metrics_address: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Policy for failures that may succeed on a later attempt.
///
/// `InvalidInput` is always recorded and `RateLimited` never is; this only
/// decides the fate of `Network` and `MalformedResponse` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnFailure {
    /// Leave the item out of the ledger so the next run picks it up again
    RetryNextRun,
    /// Record a failure marker so the item is never attempted again
    MarkTerminal,
}

impl OnFailure {
    /// Whether a failure of `kind` is written to the ledger as terminal.
    pub fn records(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::InvalidInput => true,
            FailureKind::RateLimited => false,
            FailureKind::Network | FailureKind::MalformedResponse => {
                *self == OnFailure::MarkTerminal
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub on_failure: OnFailure,
    pub max_wait: Duration,
    pub workers: usize,
    pub limit: Option<usize>,
    pub rate_limit_backoff: Duration,
    pub rate_limit_retries: u32,
}

impl From<&Config> for RunnerConfig {
    fn from(config: &Config) -> Self {
        Self {
            on_failure: config.on_failure,
            max_wait: Duration::from_secs(config.max_wait_secs),
            workers: config.workers,
            limit: config.limit,
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_secs),
            rate_limit_retries: config.rate_limit_retries,
        }
    }
}

impl From<&Config> for RateLimits {
    fn from(config: &Config) -> Self {
        Self {
            per_minute: config.per_minute_ceiling,
            per_day: config.per_day_ceiling,
            safety_margin: config.safety_margin,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.safety_margin) {
            bail!(
                "--safety-margin must be in [0, 1), got {}",
                self.safety_margin
            );
        }
        let limits = RateLimits::from(self);
        if limits.effective_per_minute() == 0 {
            bail!(
                "per-minute ceiling {} leaves no calls after a {} safety margin",
                self.per_minute_ceiling,
                self.safety_margin
            );
        }
        if limits.effective_per_day() == 0 {
            bail!(
                "per-day ceiling {} leaves no calls after a {} safety margin",
                self.per_day_ceiling,
                self.safety_margin
            );
        }
        if self.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if self.api_key.trim().is_empty() {
            bail!("GOOGLE_API_KEY is empty");
        }
        Ok(())
    }
}
