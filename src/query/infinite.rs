//! Cursor-paginated lists built from per-page cache entries.
//!
//! Every page is an ordinary cache entry with its own key and tags, so invalidating a tag
//! refetches loaded pages one by one. The coordinator only tracks which keys make up the
//! list; page data is always read back from the store.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::application::error::QueryError;
use crate::application::pagination::Page;
use crate::cache::{CacheKey, CacheStore, FetchResult, Revalidator, SubscriberId, mutex_lock};

use super::engine::{ErasedFetch, erase_fetch, resolve, start_fetch, type_mismatch};
use super::options::QueryOptions;

const SOURCE: &str = "query::infinite";

pub(crate) type PageKeyFn<T> =
    Box<dyn Fn(usize, Option<&Page<T>>) -> Option<CacheKey> + Send + Sync>;
pub(crate) type PageFetchFn<T> =
    Arc<dyn Fn(usize, u64) -> BoxFuture<'static, Result<Page<T>, QueryError>> + Send + Sync>;

struct MountedPage {
    key: CacheKey,
    subscriber: SubscriberId,
}

#[derive(Default)]
struct PagesState {
    pages: Vec<MountedPage>,
    requested: usize,
    loading: bool,
    error: Option<QueryError>,
    closed: bool,
    revalidating: usize,
}

struct InfiniteInner<T> {
    store: Arc<CacheStore>,
    get_key: PageKeyFn<T>,
    fetch_page: PageFetchFn<T>,
    page_size: u64,
    options: QueryOptions,
    state: Mutex<PagesState>,
    changes: watch::Sender<u64>,
}

impl<T: Send + Sync + 'static> InfiniteInner<T> {
    fn notify(&self) {
        self.changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    fn busy(&self) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "busy");
        state.loading || state.revalidating > 0
    }

    fn page_data(&self, key: &CacheKey) -> Option<Arc<Page<T>>> {
        self.store
            .read(key)?
            .data?
            .downcast::<Page<T>>()
            .ok()
    }

    fn page_fetch(&self, index: usize) -> ErasedFetch {
        let fetch_page = Arc::clone(&self.fetch_page);
        let size = self.page_size;
        erase_fetch(move || fetch_page(index, size))
    }

    fn page_revalidator(self: &Arc<Self>, index: usize) -> Revalidator {
        let inner = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.revalidate_page(index);
            }
        })
    }

    fn check_page(&self, key: &CacheKey, result: FetchResult) -> Result<(), QueryError> {
        let data = result?;
        if data.downcast_ref::<Page<T>>().is_some() {
            Ok(())
        } else {
            Err(type_mismatch(key))
        }
    }

    /// Request the page after the last loaded one.
    fn request_next(self: &Arc<Self>) -> bool {
        let (index, key, force) = {
            let mut state = mutex_lock(&self.state, SOURCE, "request_next");
            if state.loading || state.closed {
                return false;
            }
            let index = state.pages.len();
            let previous = match index.checked_sub(1) {
                None => None,
                Some(last) => match self.page_data(&state.pages[last].key) {
                    Some(page) => Some(page),
                    None => return false,
                },
            };
            if previous.as_ref().is_some_and(|page| page.is_last()) {
                return false;
            }
            let Some(key) = (self.get_key)(index, previous.as_deref()) else {
                debug!(page = index, "Page key unavailable, not fetching");
                return false;
            };
            state.loading = true;
            state.requested = index + 1;
            // retrying after a failure bypasses the cached error
            (index, key, state.error.is_some())
        };

        self.notify();
        tokio::spawn(Arc::clone(self).load_page(index, key, force));
        true
    }

    async fn load_page(self: Arc<Self>, index: usize, key: CacheKey, force: bool) {
        let tags = self.options.tags_for(&key);
        let fetch = self.page_fetch(index);
        let (subscriber, _changes) =
            self.store
                .subscribe(&key, &tags, self.page_revalidator(index));
        let started = start_fetch(&self.store, &key, &tags, &fetch, &self.options, force);
        let result = resolve(&self.store, &key, started).await;
        let result = self.check_page(&key, result);

        let stale = {
            let mut state = mutex_lock(&self.state, SOURCE, "load_page");
            state.loading = false;
            match result {
                Ok(()) if !state.closed && state.pages.len() == index => {
                    // an invalidation that landed mid-load could not reach the unmounted page
                    let stale = self
                        .store
                        .entry(&key)
                        .is_some_and(|entry| entry.needs_revalidation);
                    if stale {
                        state.revalidating += 1;
                    }
                    state.pages.push(MountedPage {
                        key: key.clone(),
                        subscriber,
                    });
                    state.error = None;
                    stale
                }
                Ok(()) => {
                    // list was truncated or dropped meanwhile
                    state.requested = state.pages.len();
                    self.store.unsubscribe(&key, subscriber);
                    false
                }
                Err(error) => {
                    warn!(key = %key, page = index, error = %error, "Page fetch failed");
                    state.error = Some(error);
                    state.requested = state.pages.len();
                    self.store.unsubscribe(&key, subscriber);
                    false
                }
            }
        };

        if stale {
            debug!(key = %key, page = index, "Page invalidated while loading, refetching");
            self.spawn_revalidation(index, key);
        } else {
            self.notify();
        }
    }

    fn revalidate_page(self: Arc<Self>, index: usize) {
        let key = {
            let mut state = mutex_lock(&self.state, SOURCE, "revalidate_page");
            if state.closed {
                return;
            }
            let Some(page) = state.pages.get(index) else {
                return;
            };
            let key = page.key.clone();
            state.revalidating += 1;
            key
        };
        self.spawn_revalidation(index, key);
    }

    /// Forced refetch of a mounted page. The caller has already counted it in `revalidating`.
    fn spawn_revalidation(self: Arc<Self>, index: usize, key: CacheKey) {
        let tags = self.options.tags_for(&key);
        let fetch = self.page_fetch(index);
        let started = start_fetch(&self.store, &key, &tags, &fetch, &self.options, true);
        self.notify();

        tokio::spawn(async move {
            let result = resolve(&self.store, &key, started).await;
            let result = self.check_page(&key, result);
            {
                let mut state = mutex_lock(&self.state, SOURCE, "revalidate_page.settle");
                state.revalidating = state.revalidating.saturating_sub(1);
                match result {
                    Ok(()) => {
                        self.reconcile(&mut state, index);
                        state.error = None;
                    }
                    Err(error) => state.error = Some(error),
                }
            }
            self.notify();
        });
    }

    /// Drop pages after `index` that no longer follow from its refetched contents.
    fn reconcile(&self, state: &mut PagesState, index: usize) {
        let Some(current) = state.pages.get(index) else {
            return;
        };
        let Some(page) = self.page_data(&current.key) else {
            return;
        };
        let keep = if page.is_last() {
            index + 1
        } else {
            match state.pages.get(index + 1) {
                Some(next) if (self.get_key)(index + 1, Some(&page)).as_ref() != Some(&next.key) => {
                    index + 1
                }
                _ => state.pages.len(),
            }
        };
        if keep >= state.pages.len() {
            return;
        }

        for dropped in state.pages.split_off(keep) {
            self.store.unsubscribe(&dropped.key, dropped.subscriber);
        }
        state.requested = state.pages.len() + usize::from(state.loading);
        debug!(page = index, kept = keep, "Truncated pages after refetch");
    }

    async fn wait_idle(&self) {
        let mut changes = self.changes.subscribe();
        while self.busy() {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A mounted infinite list. Page 0 is requested on creation; unsubscribes every page on drop.
pub struct InfiniteQuery<T: Send + Sync + 'static> {
    inner: Arc<InfiniteInner<T>>,
    changes: watch::Receiver<u64>,
}

impl<T: Send + Sync + 'static> InfiniteQuery<T> {
    pub(crate) fn mount(
        store: Arc<CacheStore>,
        get_key: PageKeyFn<T>,
        fetch_page: PageFetchFn<T>,
        page_size: u64,
        options: QueryOptions,
    ) -> Self {
        let (sender, changes) = watch::channel(0);
        let inner = Arc::new(InfiniteInner {
            store,
            get_key,
            fetch_page,
            page_size: page_size.max(1),
            options,
            state: Mutex::new(PagesState::default()),
            changes: sender,
        });
        inner.request_next();
        Self { inner, changes }
    }

    /// Resolved pages in order.
    pub fn pages(&self) -> Vec<Arc<Page<T>>> {
        let state = mutex_lock(&self.inner.state, SOURCE, "pages");
        state
            .pages
            .iter()
            .map_while(|page| self.inner.page_data(&page.key))
            .collect()
    }

    /// Total from page 0.
    pub fn total(&self) -> Option<u64> {
        self.pages().first().map(|page| page.total)
    }

    pub fn has_next_page(&self) -> bool {
        self.pages()
            .last()
            .is_some_and(|page| page.next_cursor.is_some())
    }

    pub fn is_loading_more(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_loading_more").loading
    }

    pub fn is_validating(&self) -> bool {
        self.inner.busy()
    }

    pub fn requested_pages(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "requested_pages").requested
    }

    pub fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    pub fn error(&self) -> Option<QueryError> {
        mutex_lock(&self.inner.state, SOURCE, "error").error.clone()
    }

    /// Request one more page. `false` when a page is loading or there is nothing more.
    pub fn load_more(&self) -> bool {
        self.inner.request_next()
    }

    /// Refetch every loaded page in order, stopping at the first page without a next cursor.
    pub async fn refetch(&self) -> Result<(), QueryError> {
        let inner = &self.inner;
        let first = mutex_lock(&inner.state, SOURCE, "refetch")
            .pages
            .first()
            .map(|page| page.key.clone());
        if first.is_none() {
            inner.request_next();
            inner.wait_idle().await;
            return match self.error() {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }

        mutex_lock(&inner.state, SOURCE, "refetch.begin").revalidating += 1;
        inner.notify();

        let mut outcome = Ok(());
        let mut index = 0;
        loop {
            let key = {
                let state = mutex_lock(&inner.state, SOURCE, "refetch.page");
                match state.pages.get(index) {
                    Some(page) => page.key.clone(),
                    None => break,
                }
            };
            let tags = inner.options.tags_for(&key);
            let fetch = inner.page_fetch(index);
            let started = start_fetch(&inner.store, &key, &tags, &fetch, &inner.options, true);
            let result = resolve(&inner.store, &key, started).await;
            if let Err(error) = inner.check_page(&key, result) {
                outcome = Err(error);
                break;
            }
            let mut state = mutex_lock(&inner.state, SOURCE, "refetch.reconcile");
            inner.reconcile(&mut state, index);
            index += 1;
        }

        {
            let mut state = mutex_lock(&inner.state, SOURCE, "refetch.end");
            state.revalidating = state.revalidating.saturating_sub(1);
            state.error = outcome.as_ref().err().cloned();
        }
        inner.notify();
        outcome
    }

    /// Wait for the next state change of the list.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }

    /// Wait until no page load or revalidation is running.
    pub async fn settled(&self) {
        self.inner.wait_idle().await;
    }
}

impl<T: Clone + Send + Sync + 'static> InfiniteQuery<T> {
    /// Flattened rows of every resolved page, in page order.
    pub fn data(&self) -> Vec<T> {
        self.pages()
            .iter()
            .flat_map(|page| page.data.iter().cloned())
            .collect()
    }
}

impl<T: Send + Sync + 'static> Drop for InfiniteQuery<T> {
    fn drop(&mut self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "drop");
        state.closed = true;
        for page in state.pages.drain(..) {
            self.inner.store.unsubscribe(&page.key, page.subscriber);
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for InfiniteQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = mutex_lock(&self.inner.state, SOURCE, "debug");
        f.debug_struct("InfiniteQuery")
            .field("pages", &state.pages.len())
            .field("requested", &state.requested)
            .field("loading", &state.loading)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::{CacheConfig, KeyParams, build_key};
    use crate::query::QueryEngine;

    fn engine() -> QueryEngine {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        QueryEngine::new(store, QueryOptions::default())
    }

    fn key(index: usize) -> CacheKey {
        build_key("rows", &KeyParams::new().with("page", index).with("size", 3_u64))
    }

    #[tokio::test]
    async fn pages_accumulate_until_the_cursor_ends() {
        let engine = engine();
        let query = engine.use_infinite_query(
            |index, _previous: Option<&Page<u64>>| Some(key(index)),
            |index, size| async move {
                let from = index as u64 * size;
                let rows: Vec<u64> = (from..(from + size).min(7)).collect();
                Ok::<_, QueryError>(Page::from_offset(rows, index as u64, size, 7))
            },
            3,
        );

        query.settled().await;
        assert!(query.load_more());
        query.settled().await;
        assert!(query.load_more());
        query.settled().await;

        assert_eq!(query.data(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(query.total(), Some(7));
        assert!(!query.has_next_page());
        assert!(!query.load_more());
        assert_eq!(query.requested_pages(), 3);
    }

    #[tokio::test]
    async fn missing_key_disables_the_list() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = engine.use_infinite_query(
            |_, _: Option<&Page<u8>>| None,
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, QueryError>(Page::new(Vec::new(), None, 0)) }
            },
            10,
        );

        query.settled().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(query.requested_pages(), 0);
        assert!(query.data().is_empty());
    }

    #[tokio::test]
    async fn failed_page_rolls_back_and_can_be_retried() {
        let engine = QueryEngine::new(
            Arc::new(CacheStore::new(&CacheConfig::default())),
            QueryOptions::default().with_retry(0, std::time::Duration::ZERO),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = engine.use_infinite_query(
            |index, _: Option<&Page<u64>>| Some(key(index)),
            move |index, size| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if index == 1 && attempt == 1 {
                        return Err(QueryError::network("dropped"));
                    }
                    Ok(Page::from_offset(vec![index as u64; size as usize], index as u64, size, 9))
                }
            },
            3,
        );

        query.settled().await;
        assert!(query.load_more());
        query.settled().await;
        assert!(query.error().is_some());
        assert_eq!(query.requested_pages(), 1);
        assert_eq!(query.pages().len(), 1);

        assert!(query.load_more());
        query.settled().await;
        assert!(query.error().is_none());
        assert_eq!(query.pages().len(), 2);
    }
}
