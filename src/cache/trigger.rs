//! Cache trigger service.
//!
//! Publishes invalidation events and consumes them right away so the next read of an affected
//! entry refetches.

use std::sync::Arc;

use tracing::debug;

use super::consumer::CacheConsumer;
use super::events::{EventKind, EventQueue};
use super::keys::{CacheKey, Tag};

/// Entry point for write paths that need to invalidate cached queries.
///
/// ```ignore
/// // After a successful team insert:
/// trigger.tags_invalidated(&[Tag::from("teams")]).await;
/// ```
pub struct CacheTrigger {
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
}

impl CacheTrigger {
    pub fn new(queue: Arc<EventQueue>, consumer: Arc<CacheConsumer>) -> Self {
        Self { queue, consumer }
    }

    /// Publish an event and consume the queue before returning.
    pub async fn trigger(&self, kind: EventKind) {
        self.queue.publish(kind);
        self.consumer.consume().await;
    }

    pub async fn tags_invalidated(&self, tags: &[Tag]) {
        if tags.is_empty() {
            debug!("Cache trigger skipped: no tags");
            return;
        }
        self.trigger(EventKind::TagsInvalidated {
            tags: tags.to_vec(),
        })
        .await;
    }

    pub async fn keys_invalidated(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            debug!("Cache trigger skipped: no keys");
            return;
        }
        self.trigger(EventKind::KeysInvalidated {
            keys: keys.to_vec(),
        })
        .await;
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<CacheConsumer> {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use futures::FutureExt;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::store::{CacheStore, ErasedData};

    fn create_trigger() -> CacheTrigger {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(&config));
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(config, store, Arc::clone(&queue)));
        CacheTrigger::new(queue, consumer)
    }

    #[tokio::test]
    async fn trigger_drains_previously_queued_events() {
        let trigger = create_trigger();
        trigger.queue().publish(EventKind::KeysInvalidated {
            keys: vec![CacheKey::from("weeks")],
        });
        assert_eq!(trigger.queue().len(), 1);

        trigger
            .trigger(EventKind::TagsInvalidated {
                tags: vec![Tag::from("posts")],
            })
            .await;
        assert!(trigger.queue().is_empty());
    }

    #[tokio::test]
    async fn empty_inputs_publish_nothing() {
        let trigger = create_trigger();
        trigger.tags_invalidated(&[]).await;
        trigger.keys_invalidated(&[]).await;
        assert!(trigger.queue().is_empty());
    }

    #[tokio::test]
    async fn key_invalidation_is_applied_immediately() {
        let trigger = create_trigger();
        let store = Arc::clone(trigger.consumer().store());
        let key = CacheKey::from("weeks");
        store
            .begin_fetch(
                &key,
                &BTreeSet::from([Tag::from("weeks")]),
                false,
                std::time::Duration::ZERO,
                || async { Ok(Arc::new(1_u8) as ErasedData) }.boxed(),
            )
            .into_future()
            .expect("started")
            .await
            .expect("data");

        trigger.keys_invalidated(std::slice::from_ref(&key)).await;
        assert!(store.entry(&key).expect("entry").needs_revalidation);
        assert!(trigger.queue().is_empty());
    }
}
