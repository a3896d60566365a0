//! Configuration for replicators.

use ferrydb_sync_protocol::ReplicationFilter;
use std::time::Duration;

/// How many document ids one `_revs_diff` request may carry.
pub const REVS_DIFF_CHUNK: usize = 25;

/// Configuration for a replicator run.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// `User-Agent` sent with every request: product and platform.
    pub user_agent: String,
    /// Changes fetched per batch.
    pub batch_size: usize,
    /// Documents per `_bulk_docs` request.
    pub bulk_chunk_size: usize,
    /// Concurrent fetchers (pull) or writers (push).
    pub parallelism: usize,
    /// Attachments up to this many bytes travel inline as base64; larger
    /// ones go multipart.
    pub inline_attachment_limit: u64,
    /// Retry behavior for transient transport failures.
    pub retry: RetryConfig,
    /// HTTP connect timeout, honored by the HTTP client implementation.
    pub connect_timeout: Duration,
    /// HTTP read timeout, honored by the HTTP client implementation.
    pub read_timeout: Duration,
    /// Optional server-side filter applied to the changes feed.
    pub filter: Option<ReplicationFilter>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            batch_size: 500,
            bulk_chunk_size: 100,
            parallelism: 4,
            inline_attachment_limit: 64 * 1024,
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            filter: None,
        }
    }
}

impl ReplicatorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of the bounded queues between pipeline stages.
    pub fn queue_capacity(&self) -> usize {
        2 * self.parallelism.max(1)
    }

    /// Sets the changes batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the fetcher/writer parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the changes-feed filter.
    pub fn with_filter(mut self, filter: ReplicationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the inline attachment threshold.
    pub fn with_inline_attachment_limit(mut self, limit: u64) -> Self {
        self.inline_attachment_limit = limit;
        self
    }
}

/// The default `User-Agent`: product, version, platform.
pub fn default_user_agent() -> String {
    format!(
        "ferrydb/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per call, including the first.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Ceiling on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if self.add_jitter {
            // Up to 25% jitter.
            Duration::from_secs_f64(capped + capped * 0.25 * time_jitter())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Cheap time-derived jitter, avoiding an RNG dependency here.
fn time_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
