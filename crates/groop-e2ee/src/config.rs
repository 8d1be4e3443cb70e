use std::time::Duration;

/// Environment override for the lookup timeout, in milliseconds.
pub const ENV_LOOKUP_TIMEOUT_MS: &str = "GROOP_E2EE_LOOKUP_TIMEOUT_MS";
/// Environment override for the number of attempts per store call.
pub const ENV_MAX_ATTEMPTS: &str = "GROOP_E2EE_MAX_RETRIES";
/// Environment override for the history decryption batch size.
pub const ENV_HISTORY_BATCH: &str = "GROOP_E2EE_HISTORY_BATCH";

/// Configuration for an [`E2eeSession`](crate::E2eeSession).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use groop_e2ee::E2eeConfig;
///
/// let config = E2eeConfig::new()
///     .lookup_timeout(Duration::from_secs(5))
///     .history_batch_size(50);
/// ```
#[derive(Debug, Clone)]
pub struct E2eeConfig {
    /// Bound on a single directory/envelope call.
    pub(crate) lookup_timeout: Duration,
    /// Attempts per store call (1 = no retry).
    pub(crate) max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub(crate) retry_base_delay: Duration,
    /// Backoff cap.
    pub(crate) retry_max_delay: Duration,
    /// Messages decrypted per batch when loading history.
    pub(crate) history_batch_size: usize,
    /// Buffer of the state-change broadcast channel.
    pub(crate) state_channel_capacity: usize,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl E2eeConfig {
    /// Create a config with defaults, then apply `GROOP_E2EE_*` overrides.
    pub fn new() -> Self {
        let mut config = Self {
            lookup_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(4),
            history_batch_size: 25,
            state_channel_capacity: 64,
        };

        if let Some(ms) = env_parse::<u64>(ENV_LOOKUP_TIMEOUT_MS) {
            config.lookup_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>(ENV_MAX_ATTEMPTS) {
            config.max_attempts = attempts.max(1);
        }
        if let Some(batch) = env_parse::<usize>(ENV_HISTORY_BATCH) {
            config.history_batch_size = batch.max(1);
        }
        config
    }

    /// Set the per-call lookup timeout (default: 10 s).
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Set attempts per store call (default: 3, minimum 1).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the backoff schedule (default: 250 ms doubling, capped at 4 s).
    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }

    /// Set the history decryption batch size (default: 25, minimum 1).
    pub fn history_batch_size(mut self, size: usize) -> Self {
        self.history_batch_size = size.max(1);
        self
    }

    /// Set the state-change channel buffer (default: 64).
    pub fn state_channel_capacity(mut self, capacity: usize) -> Self {
        self.state_channel_capacity = capacity.max(1);
        self
    }

    pub fn get_lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    pub fn get_history_batch_size(&self) -> usize {
        self.history_batch_size
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring invalid {name}={raw}");
            None
        }
    }
}
