use clap::Parser;
use review_core::{RetryPolicy, ValidatorConfig};
use std::time::Duration;

/// Dispatcher configuration.
///
/// Parse once at startup and pass `&DispatcherConfig` through; defaults are
/// sized for local development.
#[derive(Parser, Debug, Clone)]
pub struct DispatcherConfig {
    /// Work-item lease duration in seconds. Must exceed worst-case clock skew
    /// plus one heartbeat interval.
    #[arg(long, env = "REVIEW_LEASE_SECS", default_value_t = 30)]
    pub lease_secs: u64,

    /// Heartbeats fire every `lease / divisor`.
    #[arg(long, env = "REVIEW_HEARTBEAT_DIVISOR", default_value_t = 3)]
    pub heartbeat_divisor: u32,

    /// Worker sleep between empty claims, in milliseconds.
    #[arg(long, env = "REVIEW_POLL_MS", default_value_t = 250)]
    pub poll_ms: u64,

    /// Expired-lease sweeper interval in milliseconds.
    #[arg(long, env = "REVIEW_SWEEP_MS", default_value_t = 1000)]
    pub sweep_ms: u64,

    /// Outbox reconciliation interval in milliseconds.
    #[arg(long, env = "REVIEW_RECONCILE_MS", default_value_t = 5000)]
    pub reconcile_ms: u64,

    /// Rows per reconciliation scan.
    #[arg(long, env = "REVIEW_RECONCILE_BATCH", default_value_t = 50)]
    pub reconcile_batch: i64,

    /// Deadline for each external call, in seconds.
    #[arg(long, env = "REVIEW_EXTERNAL_TIMEOUT_SECS", default_value_t = 30)]
    pub external_timeout_secs: u64,

    /// Attempts per stage, inclusive of the first.
    #[arg(long, env = "REVIEW_MAX_ATTEMPTS_PER_STAGE", default_value_t = 5)]
    pub max_attempts_per_stage: i32,

    /// Backoff: initial delay in milliseconds.
    #[arg(long, env = "REVIEW_RETRY_INITIAL_MS", default_value_t = 1000)]
    pub retry_initial_ms: u64,

    /// Backoff: per-attempt multiplier.
    #[arg(long, env = "REVIEW_RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Backoff: jitter-window ceiling in seconds.
    #[arg(long, env = "REVIEW_RETRY_MAX_DELAY_SECS", default_value_t = 60)]
    pub retry_max_delay_secs: u64,

    /// Cap applied when honoring upstream Retry-After, in seconds.
    #[arg(long, env = "REVIEW_RETRY_AFTER_CAP_SECS", default_value_t = 300)]
    pub retry_after_cap_secs: u64,

    /// Priority assigned to submitted reviews.
    #[arg(long, env = "REVIEW_DEFAULT_PRIORITY", default_value_t = 0)]
    pub default_priority: i32,

    /// Path prefixes the fetcher may expand; comma separated.
    #[arg(long, env = "REVIEW_FETCH_ALLOW_LIST", value_delimiter = ',')]
    pub fetch_allow_list: Vec<String>,

    /// Expected response schema major line.
    #[arg(long, env = "REVIEW_SCHEMA_MAJOR", default_value_t = 1)]
    pub schema_major: u32,

    /// Lowest accepted schema minor on that line.
    #[arg(long, env = "REVIEW_SCHEMA_MINOR_FLOOR", default_value_t = 0)]
    pub schema_minor_floor: u32,

    /// Expected prompt version line.
    #[arg(long, env = "REVIEW_PROMPT_MAJOR", default_value_t = 1)]
    pub prompt_major: u32,

    #[arg(long, env = "REVIEW_PROMPT_MINOR", default_value_t = 0)]
    pub prompt_minor: u32,

    /// Accept a patch component on the expected prompt line.
    #[arg(
        long,
        env = "REVIEW_PROMPT_PATCH_DRIFT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub allow_prompt_patch_drift: bool,
}

impl DispatcherConfig {
    /// Parse config from environment only (no CLI parsing).
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["review-dispatcher"]))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.lease() / self.heartbeat_divisor.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            max_attempts: self.max_attempts_per_stage,
            retry_after_cap: Duration::from_secs(self.retry_after_cap_secs),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            expected_schema_major: self.schema_major,
            schema_minor_floor: self.schema_minor_floor,
            expected_prompt_major: self.prompt_major,
            expected_prompt_minor: self.prompt_minor,
            allow_prompt_patch_drift: self.allow_prompt_patch_drift,
        }
    }

    pub fn schema_version(&self) -> String {
        format!("{}.{}", self.schema_major, self.schema_minor_floor)
    }

    pub fn prompt_version(&self) -> String {
        format!("{}.{}", self.prompt_major, self.prompt_minor)
    }
}
