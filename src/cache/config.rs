//! Cache configuration.
//!
//! Controls deduplication, retry and retention behaviour via `journeyhub.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_DEDUPING_INTERVAL_MS: u64 = 60_000;
const DEFAULT_ERROR_RETRY_COUNT: u32 = 3;
const DEFAULT_ERROR_RETRY_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Cache configuration from the `[cache]` section of `journeyhub.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Window (ms) during which a failed fetch's error is reused instead of refetching.
    pub deduping_interval_ms: u64,
    /// Retries after the first failed attempt.
    pub error_retry_count: u32,
    /// Fixed delay (ms) between retries.
    pub error_retry_interval_ms: u64,
    /// Keep the previous key's data visible while a new key loads.
    pub keep_previous_data: bool,
    /// Maximum cached entries; 0 keeps every entry for the process lifetime.
    pub max_entries: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            deduping_interval_ms: DEFAULT_DEDUPING_INTERVAL_MS,
            error_retry_count: DEFAULT_ERROR_RETRY_COUNT,
            error_retry_interval_ms: DEFAULT_ERROR_RETRY_INTERVAL_MS,
            keep_previous_data: true,
            max_entries: 0,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            deduping_interval_ms: duration_ms(settings.deduping_interval),
            error_retry_count: settings.error_retry_count,
            error_retry_interval_ms: duration_ms(settings.error_retry_interval),
            keep_previous_data: settings.keep_previous_data,
            max_entries: settings.max_entries,
            consume_batch_limit: settings.consume_batch_limit.get() as usize,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CacheConfig {
    pub fn deduping_interval(&self) -> Duration {
        Duration::from_millis(self.deduping_interval_ms)
    }

    pub fn error_retry_interval(&self) -> Duration {
        Duration::from_millis(self.error_retry_interval_ms)
    }

    /// Entry limit, or `None` when the cache is unbounded.
    pub fn max_entries_non_zero(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_entries)
    }

    /// Returns the batch limit, clamping to 1 if zero.
    pub fn consume_batch_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.consume_batch_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
