//! Cache entry storage.
//!
//! One slot per cache key holds the last settled data and error, subscriber bookkeeping and a
//! version channel that mounted handles watch for changes. Fetches are tracked in a separate
//! in-flight table so concurrent requests for the same key share a single future.
//!
//! Lock order: in-flight table, then slots, then registry. Revalidators are returned to the
//! caller and must be invoked after every lock is released.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::application::error::QueryError;

use super::config::CacheConfig;
use super::keys::{CacheKey, Tag};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::registry::CacheRegistry;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT: &str = "journeyhub_cache_evict_total";
const METRIC_QUERY_DEDUP: &str = "journeyhub_query_dedup_total";

/// Type-erased cached value. Handles downcast it back to their own `T`.
pub type ErasedData = Arc<dyn Any + Send + Sync>;
pub type FetchResult = Result<ErasedData, QueryError>;
pub type FetchFuture = Shared<BoxFuture<'static, FetchResult>>;
/// Callback that restarts a mounted entry's fetch.
pub type Revalidator = Arc<dyn Fn() + Send + Sync>;
pub type SubscriberId = u64;

/// Outcome of [`CacheStore::begin_fetch`].
pub enum Fetch {
    /// The cached data or recent error is still authoritative; nothing was started.
    Cached,
    /// Another caller's fetch for the same key is in flight.
    Joined(FetchFuture),
    Started(FetchFuture),
}

impl Fetch {
    pub fn into_future(self) -> Option<FetchFuture> {
        match self {
            Fetch::Cached => None,
            Fetch::Joined(future) | Fetch::Started(future) => Some(future),
        }
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub has_data: bool,
    pub error: Option<QueryError>,
    pub last_fetched_at: Option<OffsetDateTime>,
    pub subscriber_count: usize,
    pub is_validating: bool,
    pub needs_revalidation: bool,
    pub tags: BTreeSet<Tag>,
}

pub(crate) struct SlotView {
    pub data: Option<ErasedData>,
    pub error: Option<QueryError>,
    pub is_validating: bool,
}

struct Slot {
    data: Option<ErasedData>,
    error: Option<QueryError>,
    error_at: Option<Instant>,
    last_fetched_at: Option<OffsetDateTime>,
    subscribers: Vec<(SubscriberId, Revalidator)>,
    is_validating: bool,
    needs_revalidation: bool,
    // invalidated while a fetch was running
    revalidate_after_fetch: bool,
    tags: BTreeSet<Tag>,
    version: watch::Sender<u64>,
}

impl Slot {
    fn new() -> Self {
        Self {
            data: None,
            error: None,
            error_at: None,
            last_fetched_at: None,
            subscribers: Vec::new(),
            is_validating: false,
            needs_revalidation: false,
            revalidate_after_fetch: false,
            tags: BTreeSet::new(),
            version: watch::Sender::new(0),
        }
    }

    fn touch(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Whether a non-forced request may be answered without fetching.
    ///
    /// Data never goes stale by age; only invalidation or an expired error forces a refetch.
    fn reusable(&self, now: Instant, window: Duration) -> bool {
        if self.needs_revalidation {
            return false;
        }
        if let Some(failed_at) = self.error_at {
            return now.saturating_duration_since(failed_at) < window;
        }
        self.data.is_some()
    }

    fn revalidator(&self) -> Option<Revalidator> {
        self.subscribers
            .first()
            .map(|(_, revalidator)| Arc::clone(revalidator))
    }

    fn evictable(&self) -> bool {
        self.subscribers.is_empty() && !self.is_validating
    }
}

struct Inflight {
    id: u64,
    future: FetchFuture,
}

/// Explicit cache store shared by every query and mutation of one client.
pub struct CacheStore {
    slots: RwLock<LruCache<CacheKey, Slot>>,
    registry: CacheRegistry,
    inflight: Mutex<HashMap<CacheKey, Inflight>>,
    max_entries: Option<NonZeroUsize>,
    next_subscriber: AtomicU64,
    next_fetch: AtomicU64,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            slots: RwLock::new(LruCache::unbounded()),
            registry: CacheRegistry::new(),
            inflight: Mutex::new(HashMap::new()),
            max_entries: config.max_entries_non_zero(),
            next_subscriber: AtomicU64::new(1),
            next_fetch: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for `key`, creating the entry if needed.
    ///
    /// The returned receiver observes every change to the entry.
    pub fn subscribe(
        &self,
        key: &CacheKey,
        tags: &BTreeSet<Tag>,
        revalidator: Revalidator,
    ) -> (SubscriberId, watch::Receiver<u64>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let receiver = {
            let mut slots = rw_write(&self.slots, SOURCE, "subscribe");
            let slot = slots.get_or_insert_mut(key.clone(), Slot::new);
            slot.tags.extend(tags.iter().cloned());
            slot.subscribers.push((id, revalidator));
            slot.version.subscribe()
        };
        self.registry.register(key, tags);
        self.evict_overflow();
        (id, receiver)
    }

    /// Drop a subscriber. The entry and its data stay cached.
    pub fn unsubscribe(&self, key: &CacheKey, id: SubscriberId) {
        {
            let mut slots = rw_write(&self.slots, SOURCE, "unsubscribe");
            if let Some(slot) = slots.peek_mut(key) {
                slot.subscribers.retain(|(subscriber, _)| *subscriber != id);
            }
        }
        self.evict_overflow();
    }

    /// Start a fetch for `key` unless one is in flight or the cached outcome still applies.
    ///
    /// `force` skips the cached-outcome check but still joins an in-flight fetch. The fetch
    /// runs on a spawned task so it settles even if every awaiting caller goes away.
    pub fn begin_fetch<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        tags: &BTreeSet<Tag>,
        force: bool,
        dedup_window: Duration,
        run: F,
    ) -> Fetch
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let mut inflight = mutex_lock(&self.inflight, SOURCE, "begin_fetch.inflight");
        if let Some(current) = inflight.get(key) {
            counter!(METRIC_QUERY_DEDUP, "reason" => "inflight").increment(1);
            debug!(key = %key, force, "Joined in-flight fetch");
            return Fetch::Joined(current.future.clone());
        }

        let reused = {
            let mut slots = rw_write(&self.slots, SOURCE, "begin_fetch.slots");
            let slot = slots.get_or_insert_mut(key.clone(), Slot::new);
            slot.tags.extend(tags.iter().cloned());
            if !force && slot.reusable(Instant::now(), dedup_window) {
                true
            } else {
                slot.is_validating = true;
                slot.needs_revalidation = false;
                slot.revalidate_after_fetch = false;
                slot.touch();
                false
            }
        };

        if reused {
            drop(inflight);
            self.registry.register(key, tags);
            counter!(METRIC_QUERY_DEDUP, "reason" => "cached").increment(1);
            debug!(key = %key, "Served from cache");
            self.evict_overflow();
            return Fetch::Cached;
        }

        let fetch_id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
        let store = Arc::downgrade(self);
        let settle_key = key.clone();
        let work = run();
        let future = async move {
            let result = work.await;
            if let Some(store) = store.upgrade() {
                if let Some(revalidate) = store.settle(&settle_key, fetch_id, &result) {
                    revalidate();
                }
                store.evict_overflow();
            }
            result
        }
        .boxed()
        .shared();

        inflight.insert(
            key.clone(),
            Inflight {
                id: fetch_id,
                future: future.clone(),
            },
        );
        drop(inflight);

        self.registry.register(key, tags);
        debug!(key = %key, fetch_id, force, "Fetch started");
        tokio::spawn(future.clone());
        Fetch::Started(future)
    }

    /// Record a fetch result. Results from fetches no longer tracked (teardown) are ignored.
    fn settle(&self, key: &CacheKey, fetch_id: u64, result: &FetchResult) -> Option<Revalidator> {
        let mut inflight = mutex_lock(&self.inflight, SOURCE, "settle.inflight");
        match inflight.get(key) {
            Some(current) if current.id == fetch_id => {
                inflight.remove(key);
            }
            _ => {
                debug!(key = %key, fetch_id, "Ignoring result of superseded fetch");
                return None;
            }
        }

        let mut slots = rw_write(&self.slots, SOURCE, "settle.slots");
        let slot = slots.peek_mut(key)?;
        match result {
            Ok(data) => {
                slot.data = Some(Arc::clone(data));
                slot.error = None;
                slot.error_at = None;
                slot.last_fetched_at = Some(OffsetDateTime::now_utc());
            }
            Err(error) => {
                // stale data is retained alongside the error
                slot.error = Some(error.clone());
                slot.error_at = Some(Instant::now());
            }
        }
        slot.is_validating = false;

        let retrigger = if slot.revalidate_after_fetch {
            slot.revalidate_after_fetch = false;
            slot.revalidator()
        } else {
            None
        };
        slot.touch();
        retrigger
    }

    /// Cached outcome for `key`: the retained error if the last fetch failed, else the data.
    pub fn outcome(&self, key: &CacheKey) -> Option<FetchResult> {
        let slots = rw_read(&self.slots, SOURCE, "outcome");
        let slot = slots.peek(key)?;
        if let Some(error) = &slot.error {
            return Some(Err(error.clone()));
        }
        slot.data.clone().map(Ok)
    }

    pub(crate) fn read(&self, key: &CacheKey) -> Option<SlotView> {
        rw_read(&self.slots, SOURCE, "read")
            .peek(key)
            .map(|slot| SlotView {
                data: slot.data.clone(),
                error: slot.error.clone(),
                is_validating: slot.is_validating,
            })
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        rw_read(&self.slots, SOURCE, "entry")
            .peek(key)
            .map(|slot| CacheEntry {
                key: key.clone(),
                has_data: slot.data.is_some(),
                error: slot.error.clone(),
                last_fetched_at: slot.last_fetched_at,
                subscriber_count: slot.subscribers.len(),
                is_validating: slot.is_validating,
                needs_revalidation: slot.needs_revalidation,
                tags: slot.tags.clone(),
            })
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.slots, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inflight_count(&self) -> usize {
        mutex_lock(&self.inflight, SOURCE, "inflight_count").len()
    }

    /// Mark every entry carrying one of `tags` as needing revalidation.
    ///
    /// Returns revalidators for mounted, idle entries; entries mid-fetch refetch once the
    /// running fetch settles.
    pub fn invalidate_tags<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> Vec<Revalidator> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            keys.extend(self.registry.keys_for_tag(tag));
        }
        self.invalidate_keys(&keys)
    }

    pub fn invalidate_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a CacheKey>,
    ) -> Vec<Revalidator> {
        let mut slots = rw_write(&self.slots, SOURCE, "invalidate_keys");
        let mut revalidators = Vec::new();
        for key in keys {
            let Some(slot) = slots.peek_mut(key) else {
                continue;
            };
            slot.needs_revalidation = true;
            if slot.is_validating {
                slot.revalidate_after_fetch = true;
            } else if let Some(revalidator) = slot.revalidator() {
                revalidators.push(revalidator);
            }
            slot.touch();
        }
        revalidators
    }

    /// Drop every entry and forget in-flight fetches; their results are ignored when they land.
    pub fn clear(&self) {
        mutex_lock(&self.inflight, SOURCE, "clear.inflight").clear();
        rw_write(&self.slots, SOURCE, "clear.slots").clear();
        self.registry.clear();
        debug!("Cache store cleared");
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    fn evict_overflow(&self) {
        let Some(limit) = self.max_entries else {
            return;
        };

        let mut slots = rw_write(&self.slots, SOURCE, "evict_overflow");
        while slots.len() > limit.get() {
            let victim = slots
                .iter()
                .rev()
                .find(|(_, slot)| slot.evictable())
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            slots.pop(&key);
            self.registry.unregister(&key);
            counter!(METRIC_CACHE_EVICT).increment(1);
            debug!(key = %key, "Evicted cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn tags(name: &str) -> BTreeSet<Tag> {
        BTreeSet::from([Tag::from(name)])
    }

    fn value(v: u32) -> impl FnOnce() -> BoxFuture<'static, FetchResult> {
        move || async move { Ok(Arc::new(v) as ErasedData) }.boxed()
    }

    fn failing() -> impl FnOnce() -> BoxFuture<'static, FetchResult> {
        || async { Err(QueryError::network("offline")) }.boxed()
    }

    fn counting_revalidator(counter: &Arc<AtomicUsize>) -> Revalidator {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle(fetch: Fetch) -> FetchResult {
        fetch.into_future().expect("fetch started").await
    }

    fn store() -> Arc<CacheStore> {
        Arc::new(CacheStore::new(&CacheConfig::default()))
    }

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn concurrent_fetches_share_one_future() {
        let store = store();
        let key = CacheKey::from("teams");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let first = store.begin_fetch(&key, &tags("teams"), false, WINDOW, move || {
            async move {
                let _ = rx.await;
                Ok(Arc::new(1_u32) as ErasedData)
            }
            .boxed()
        });
        let second = store.begin_fetch(&key, &tags("teams"), true, WINDOW, value(2));

        assert!(matches!(first, Fetch::Started(_)));
        assert!(matches!(second, Fetch::Joined(_)));
        tx.send(()).expect("receiver alive");

        let data = settle(second).await.expect("data");
        assert_eq!(data.downcast_ref::<u32>(), Some(&1));
        assert_eq!(store.inflight_count(), 0);
    }

    #[tokio::test]
    async fn settled_data_is_reused_until_forced() {
        let store = store();
        let key = CacheKey::from("weeks");
        settle(store.begin_fetch(&key, &tags("weeks"), false, WINDOW, value(1)))
            .await
            .expect("data");

        assert!(matches!(
            store.begin_fetch(&key, &tags("weeks"), false, WINDOW, value(2)),
            Fetch::Cached
        ));

        let forced = settle(store.begin_fetch(&key, &tags("weeks"), true, WINDOW, value(3)))
            .await
            .expect("data");
        assert_eq!(forced.downcast_ref::<u32>(), Some(&3));
        assert!(store.entry(&key).expect("entry").last_fetched_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_reused_within_the_window() {
        let store = store();
        let key = CacheKey::from("missions");
        assert!(
            settle(store.begin_fetch(&key, &tags("missions"), false, WINDOW, failing()))
                .await
                .is_err()
        );

        assert!(matches!(
            store.begin_fetch(&key, &tags("missions"), false, WINDOW, value(1)),
            Fetch::Cached
        ));
        assert!(matches!(store.outcome(&key), Some(Err(_))));

        tokio::time::advance(WINDOW).await;
        let retried = store.begin_fetch(&key, &tags("missions"), false, WINDOW, value(1));
        assert!(settle(retried).await.is_ok());
        assert!(store.entry(&key).expect("entry").error.is_none());
    }

    #[tokio::test]
    async fn failed_refetch_keeps_previous_data() {
        let store = store();
        let key = CacheKey::from("posts");
        settle(store.begin_fetch(&key, &tags("posts"), false, WINDOW, value(7)))
            .await
            .expect("data");
        let _ = settle(store.begin_fetch(&key, &tags("posts"), true, WINDOW, failing())).await;

        let view = store.read(&key).expect("slot");
        assert!(view.error.is_some());
        assert_eq!(
            view.data.as_ref().and_then(|d| d.downcast_ref::<u32>()),
            Some(&7)
        );
    }

    #[tokio::test]
    async fn invalidation_marks_unmounted_and_returns_mounted_revalidators() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let mounted = CacheKey::from("teams");
        let unmounted = CacheKey::from("teams:{\"week\":1}");

        let (_id, _rx) = store.subscribe(&mounted, &tags("teams"), counting_revalidator(&calls));
        settle(store.begin_fetch(&mounted, &tags("teams"), false, WINDOW, value(1)))
            .await
            .expect("data");
        settle(store.begin_fetch(&unmounted, &tags("teams"), false, WINDOW, value(2)))
            .await
            .expect("data");

        let revalidators = store.invalidate_tags(&[Tag::from("teams")]);
        assert_eq!(revalidators.len(), 1);
        assert!(store.entry(&unmounted).expect("entry").needs_revalidation);

        assert!(matches!(
            store.begin_fetch(&unmounted, &tags("teams"), false, WINDOW, value(3)),
            Fetch::Started(_)
        ));
    }

    #[tokio::test]
    async fn similar_tag_names_do_not_collide() {
        let store = store();
        let key = CacheKey::from("teams-data");
        settle(store.begin_fetch(&key, &tags("teams-data"), false, WINDOW, value(1)))
            .await
            .expect("data");

        store.invalidate_tags(&[Tag::from("team")]);
        assert!(!store.entry(&key).expect("entry").needs_revalidation);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_retriggers_after_settle() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from("notifications");
        let (_id, _rx) = store.subscribe(&key, &tags("notifications"), counting_revalidator(&calls));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let fetch = store.begin_fetch(&key, &tags("notifications"), false, WINDOW, move || {
            async move {
                let _ = rx.await;
                Ok(Arc::new(1_u32) as ErasedData)
            }
            .boxed()
        });
        assert!(store.invalidate_tags(&[Tag::from("notifications")]).is_empty());

        tx.send(()).expect("receiver alive");
        settle(fetch).await.expect("data");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.entry(&key).expect("entry").needs_revalidation);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_entry() {
        let store = store();
        let key = CacheKey::from("users");
        let (id, _rx) = store.subscribe(&key, &tags("users"), Arc::new(|| {}));
        assert_eq!(store.entry(&key).expect("entry").subscriber_count, 1);

        store.unsubscribe(&key, id);
        let entry = store.entry(&key).expect("entry kept");
        assert_eq!(entry.subscriber_count, 0);
    }

    #[tokio::test]
    async fn clear_ignores_inflight_results() {
        let store = store();
        let key = CacheKey::from("journeys");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let fetch = store.begin_fetch(&key, &tags("journeys"), false, WINDOW, move || {
            async move {
                let _ = rx.await;
                Ok(Arc::new(1_u32) as ErasedData)
            }
            .boxed()
        });

        store.clear();
        tx.send(()).expect("receiver alive");
        let _ = settle(fetch).await;

        assert!(store.is_empty());
        assert_eq!(store.registry().key_count(), 0);
    }

    #[tokio::test]
    async fn bounded_store_evicts_idle_entries_first() {
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let store = Arc::new(CacheStore::new(&config));
        let pinned = CacheKey::from("pinned");
        let (_id, _rx) = store.subscribe(&pinned, &tags("pinned"), Arc::new(|| {}));

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let key = CacheKey::from(*name);
            settle(store.begin_fetch(&key, &tags(name), false, WINDOW, value(i as u32)))
                .await
                .expect("data");
        }

        assert_eq!(store.len(), 2);
        assert!(store.entry(&pinned).is_some());
        assert!(store.entry(&CacheKey::from("c")).is_some());
        assert!(store.registry().keys_for_tag(&Tag::from("a")).is_empty());
    }
}
