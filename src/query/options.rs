use std::collections::BTreeSet;
use std::time::Duration;

use crate::cache::{CacheConfig, CacheKey, Tag};

/// Per-query behaviour. Engine defaults come from [`CacheConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub deduping_interval: Duration,
    pub error_retry_count: u32,
    pub error_retry_interval: Duration,
    pub keep_previous_data: bool,
    /// Tags attached to the entry; empty means the key's base name.
    pub tags: Vec<Tag>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for QueryOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            deduping_interval: config.deduping_interval(),
            error_retry_count: config.error_retry_count,
            error_retry_interval: config.error_retry_interval(),
            keep_previous_data: config.keep_previous_data,
            tags: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, count: u32, interval: Duration) -> Self {
        self.error_retry_count = count;
        self.error_retry_interval = interval;
        self
    }

    pub fn with_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn tags_for(&self, key: &CacheKey) -> BTreeSet<Tag> {
        if self.tags.is_empty() {
            BTreeSet::from([Tag::new(key.base())])
        } else {
            self.tags.iter().cloned().collect()
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            count: self.error_retry_count,
            interval: self.error_retry_interval,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub count: u32,
    pub interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KeyParams, build_key};

    #[test]
    fn default_tag_is_key_base() {
        let key = build_key("posts", &KeyParams::new().with("status", "open"));
        let tags = QueryOptions::default().tags_for(&key);
        assert_eq!(tags, BTreeSet::from([Tag::from("posts")]));
    }

    #[test]
    fn explicit_tags_replace_default() {
        let options = QueryOptions::default().with_tags(["dashboard", "teams"]);
        let tags = options.tags_for(&CacheKey::from("team-summary"));
        assert_eq!(tags.len(), 2);
        assert!(!tags.contains(&Tag::from("team-summary")));
    }

    #[test]
    fn defaults_follow_cache_config() {
        let options = QueryOptions::default();
        assert_eq!(options.error_retry_count, 3);
        assert_eq!(options.error_retry_interval, Duration::from_secs(5));
        assert_eq!(options.deduping_interval, Duration::from_secs(60));
        assert!(options.keep_previous_data);
    }
}
