//! Cache consumer for executing invalidation plans.
//!
//! Drains events from the queue, marks matching entries stale and kicks off revalidation of
//! the mounted ones without waiting for those fetches.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::EventQueue;
use super::planner::InvalidationPlan;
use super::store::CacheStore;

const METRIC_CACHE_CONSUME_MS: &str = "journeyhub_cache_consume_ms";

pub struct CacheConsumer {
    config: CacheConfig,
    store: Arc<CacheStore>,
    queue: Arc<EventQueue>,
}

impl CacheConsumer {
    pub fn new(config: CacheConfig, store: Arc<CacheStore>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    /// Consume every pending event, batch by batch.
    ///
    /// Returns true if any events were processed.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> bool {
        let mut processed = false;
        while self.consume_batch() {
            processed = true;
        }
        processed
    }

    fn consume_batch(&self) -> bool {
        let consume_started_at = Instant::now();
        let events = self
            .queue
            .drain(self.config.consume_batch_limit_non_zero().get());
        if events.is_empty() {
            return false;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = InvalidationPlan::from_events(events);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption starting"
        );

        let mut revalidators = self.store.invalidate_tags(&plan.tags);
        revalidators.extend(self.store.invalidate_keys(&plan.keys));
        let revalidated = revalidators.len();
        for revalidate in revalidators {
            revalidate();
        }

        info!(event_count, revalidated, "Cache consumption complete");

        histogram!(METRIC_CACHE_CONSUME_MS)
            .record(consume_started_at.elapsed().as_secs_f64() * 1000.0);

        true
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::cache::events::EventKind;
    use crate::cache::keys::{CacheKey, Tag};
    use crate::cache::store::ErasedData;

    fn create_consumer(config: CacheConfig) -> CacheConsumer {
        let store = Arc::new(CacheStore::new(&config));
        let queue = Arc::new(EventQueue::new());
        CacheConsumer::new(config, store, queue)
    }

    fn teams() -> EventKind {
        EventKind::TagsInvalidated {
            tags: vec![Tag::from("teams")],
        }
    }

    #[tokio::test]
    async fn consume_empty_queue_returns_false() {
        let consumer = create_consumer(CacheConfig::default());
        assert!(!consumer.consume().await);
    }

    #[tokio::test]
    async fn consume_drains_every_batch() {
        let consumer = create_consumer(CacheConfig {
            consume_batch_limit: 2,
            ..Default::default()
        });
        for _ in 0..5 {
            consumer.queue.publish(teams());
        }

        assert!(consumer.consume().await);
        assert!(consumer.queue.is_empty());
    }

    #[tokio::test]
    async fn consume_marks_entries_and_runs_revalidators() {
        let consumer = create_consumer(CacheConfig::default());
        let store = Arc::clone(consumer.store());
        let key = CacheKey::from("teams");
        let tags = BTreeSet::from([Tag::from("teams")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (_id, _rx) = store.subscribe(
            &key,
            &tags,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        store
            .begin_fetch(&key, &tags, false, std::time::Duration::ZERO, || {
                async { Ok(Arc::new(()) as ErasedData) }.boxed()
            })
            .into_future()
            .expect("started")
            .await
            .expect("data");

        consumer.queue.publish(teams());
        consumer.queue.publish(EventKind::KeysInvalidated {
            keys: vec![CacheKey::from("unknown")],
        });
        assert!(consumer.consume().await);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.entry(&key).expect("entry").needs_revalidation);
    }
}
