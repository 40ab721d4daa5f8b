//! Query engine: mounts handles on the shared cache store and drives fetches.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use metrics::{counter, histogram};
use tracing::warn;

use crate::application::error::QueryError;
use crate::application::pagination::Page;
use crate::application::remote::RemoteStore;
use crate::cache::{CacheKey, CacheStore, ErasedData, Fetch, FetchResult, Revalidator, Tag};

use super::fetcher::Fetcher;
use super::handle::QueryHandle;
use super::infinite::InfiniteQuery;
use super::options::{QueryOptions, RetryPolicy};

const METRIC_QUERY_FETCH: &str = "journeyhub_query_fetch_total";
const METRIC_QUERY_FETCH_MS: &str = "journeyhub_query_fetch_ms";
const METRIC_QUERY_RETRY: &str = "journeyhub_query_retry_total";

/// Type-erased fetch attempt. Panics and fetcher errors come back as [`QueryError`].
pub(crate) type ErasedFetch = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

pub(crate) fn erase_fetch<T, F, Fut, E>(fetch: F) -> ErasedFetch
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + Sync + 'static,
    E: Into<QueryError>,
{
    let fetch = Arc::new(fetch);
    Arc::new(move || {
        let fetch = Arc::clone(&fetch);
        async move {
            let attempt = match panic::catch_unwind(AssertUnwindSafe(|| (*fetch)())) {
                Ok(attempt) => attempt,
                Err(payload) => return Err(QueryError::from_panic(payload)),
            };
            match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result
                    .map(|value| Arc::new(value) as ErasedData)
                    .map_err(Into::into),
                Err(payload) => Err(QueryError::from_panic(payload)),
            }
        }
        .boxed()
    })
}

/// Run `fetch`, retrying retryable failures on a fixed interval.
///
/// When retries were attempted and all failed, the settled error is a timeout carrying the
/// last failure. Non-retryable failures settle immediately with their own kind.
pub(crate) async fn run_with_retry(
    fetch: ErasedFetch,
    key: CacheKey,
    policy: RetryPolicy,
) -> FetchResult {
    let started_at = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match fetch().await {
            Ok(data) => {
                counter!(METRIC_QUERY_FETCH, "outcome" => "ok").increment(1);
                histogram!(METRIC_QUERY_FETCH_MS)
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                return Ok(data);
            }
            Err(error) if error.is_retryable() && attempt <= policy.count => {
                warn!(
                    key = %key,
                    attempt,
                    retry_in_ms = policy.interval.as_millis() as u64,
                    error = %error,
                    "Query fetch failed, retrying"
                );
                counter!(METRIC_QUERY_RETRY).increment(1);
                tokio::time::sleep(policy.interval).await;
            }
            Err(error) => {
                let settled = if attempt > 1 && error.is_retryable() {
                    QueryError::retries_exhausted(attempt, error)
                } else {
                    error
                };
                warn!(
                    key = %key,
                    attempt,
                    kind = ?settled.kind,
                    error = %settled,
                    "Query fetch failed"
                );
                counter!(METRIC_QUERY_FETCH, "outcome" => "error").increment(1);
                histogram!(METRIC_QUERY_FETCH_MS)
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                return Err(settled);
            }
        }
    }
}

pub(crate) fn start_fetch(
    store: &Arc<CacheStore>,
    key: &CacheKey,
    tags: &BTreeSet<Tag>,
    fetch: &ErasedFetch,
    options: &QueryOptions,
    force: bool,
) -> Fetch {
    let fetch = Arc::clone(fetch);
    let retry_key = key.clone();
    let policy = options.retry_policy();
    store.begin_fetch(key, tags, force, options.deduping_interval, move || {
        run_with_retry(fetch, retry_key, policy).boxed()
    })
}

/// Revalidator registered for a mounted handle: forces a fresh fetch of its key.
pub(crate) fn revalidator(
    store: Weak<CacheStore>,
    key: CacheKey,
    tags: BTreeSet<Tag>,
    fetch: ErasedFetch,
    options: QueryOptions,
) -> Revalidator {
    Arc::new(move || {
        if let Some(store) = store.upgrade() {
            start_fetch(&store, &key, &tags, &fetch, &options, true);
        }
    })
}

/// Await a fetch, falling back to the cached outcome when nothing had to run.
pub(crate) async fn resolve(store: &CacheStore, key: &CacheKey, fetch: Fetch) -> FetchResult {
    match fetch.into_future() {
        Some(future) => future.await,
        None => store
            .outcome(key)
            .unwrap_or_else(|| {
                Err(QueryError::unexpected(format!("cache entry `{key}` vanished")))
            }),
    }
}

pub(crate) fn type_mismatch(key: &CacheKey) -> QueryError {
    QueryError::unexpected(format!("cached value for `{key}` has a different type"))
        .with_code("TYPE_MISMATCH")
}

/// Entry point for mounting queries against one cache store.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<CacheStore>,
    defaults: QueryOptions,
}

impl QueryEngine {
    pub fn new(store: Arc<CacheStore>, defaults: QueryOptions) -> Self {
        Self { store, defaults }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn defaults(&self) -> &QueryOptions {
        &self.defaults
    }

    /// Mount a query. `None` disables it: nothing is fetched until a key is set.
    pub fn use_query<T, F, Fut, E>(&self, key: Option<CacheKey>, fetch: F) -> QueryHandle<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError>,
    {
        self.use_query_with(key, fetch, self.defaults.clone())
    }

    pub fn use_query_with<T, F, Fut, E>(
        &self,
        key: Option<CacheKey>,
        fetch: F,
        options: QueryOptions,
    ) -> QueryHandle<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError>,
    {
        QueryHandle::mount(Arc::clone(&self.store), erase_fetch(fetch), options, key)
    }

    /// Mount a typed [`Fetcher`] with its client and parameters.
    pub fn use_fetcher<P, X>(
        &self,
        key: Option<CacheKey>,
        fetcher: Arc<X>,
        client: Arc<dyn RemoteStore>,
        params: P,
        options: QueryOptions,
    ) -> QueryHandle<X::Output>
    where
        P: Send + Sync + 'static,
        X: Fetcher<P>,
    {
        let params = Arc::new(params);
        self.use_query_with(
            key,
            move || {
                let fetcher = Arc::clone(&fetcher);
                let client = Arc::clone(&client);
                let params = Arc::clone(&params);
                async move { fetcher.fetch(client.as_ref(), &params).await }
            },
            options,
        )
    }

    /// Mount a cursor-paginated list. Page 0 is requested immediately.
    pub fn use_infinite_query<T, G, F, Fut, E>(
        &self,
        get_key: G,
        fetch_page: F,
        page_size: u64,
    ) -> InfiniteQuery<T>
    where
        T: Send + Sync + 'static,
        G: Fn(usize, Option<&Page<T>>) -> Option<CacheKey> + Send + Sync + 'static,
        F: Fn(usize, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T>, E>> + Send + 'static,
        E: Into<QueryError>,
    {
        self.use_infinite_query_with(get_key, fetch_page, page_size, self.defaults.clone())
    }

    pub fn use_infinite_query_with<T, G, F, Fut, E>(
        &self,
        get_key: G,
        fetch_page: F,
        page_size: u64,
        options: QueryOptions,
    ) -> InfiniteQuery<T>
    where
        T: Send + Sync + 'static,
        G: Fn(usize, Option<&Page<T>>) -> Option<CacheKey> + Send + Sync + 'static,
        F: Fn(usize, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T>, E>> + Send + 'static,
        E: Into<QueryError>,
    {
        InfiniteQuery::mount(
            Arc::clone(&self.store),
            Box::new(get_key),
            Arc::new(move |index, size| {
                fetch_page(index, size)
                    .map(|result| result.map_err(Into::into))
                    .boxed()
            }),
            page_size,
            options,
        )
    }
}
