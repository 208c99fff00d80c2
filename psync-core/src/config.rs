/// Engine configuration for batching, retry, and reconciliation cadence
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long edits accumulate before a batch is flushed, in milliseconds
    pub batch_window_ms: u64,

    /// Pending-batch size that triggers an immediate flush, bypassing the window
    pub batch_flush_threshold: usize,

    /// Interval between reconciliation ticks, in milliseconds
    pub sync_interval_ms: u64,

    /// Maximum entries in the offline outbox before oldest-first eviction
    pub max_queue_size: usize,

    /// Total save attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Cap on any single backoff delay, in milliseconds
    pub max_delay_ms: u64,

    /// Per-request timeout; expiry counts as a transport failure
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 2000,
            batch_flush_threshold: 10,
            sync_interval_ms: 30_000,
            max_queue_size: 100,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch accumulation window in milliseconds
    pub fn with_batch_window_ms(mut self, ms: u64) -> Self {
        self.batch_window_ms = ms;
        self
    }

    /// Set the pending-batch size that flushes immediately
    pub fn with_batch_flush_threshold(mut self, threshold: usize) -> Self {
        self.batch_flush_threshold = threshold;
        self
    }

    /// Set the reconciliation interval in milliseconds
    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.sync_interval_ms = ms;
        self
    }

    /// Set the outbox capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the total number of save attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry
    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_flush_threshold == 0 {
            return Err("batch_flush_threshold must be greater than 0".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }

        if self.sync_interval_ms == 0 {
            return Err("sync_interval_ms must be greater than 0".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}
