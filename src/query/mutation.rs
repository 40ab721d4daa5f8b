//! Writes followed by tag invalidation.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::application::error::QueryError;
use crate::cache::{CacheKey, CacheTrigger, Tag, mutex_lock};

const SOURCE: &str = "query::mutation";
const METRIC_MUTATION: &str = "journeyhub_mutation_total";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutateOptions {
    /// Tags invalidated once the write succeeds.
    pub revalidate_tags: Vec<Tag>,
}

impl MutateOptions {
    pub fn revalidate<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Self {
            revalidate_tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runs writes and broadcasts invalidation for the tags they touch.
///
/// Invalidation is fire-and-forget: `execute` resolves with the write's outcome and never
/// waits for the refetches it triggers.
#[derive(Clone)]
pub struct MutationExecutor {
    trigger: Arc<CacheTrigger>,
}

impl MutationExecutor {
    pub fn new(trigger: Arc<CacheTrigger>) -> Self {
        Self { trigger }
    }

    #[instrument(skip_all, fields(tags = ?options.revalidate_tags))]
    pub async fn execute<P, T, E, F, Fut>(
        &self,
        mutate: F,
        params: P,
        options: &MutateOptions,
    ) -> Result<T, QueryError>
    where
        F: FnOnce(P) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<QueryError>,
    {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| mutate(params))) {
            Ok(write) => match AssertUnwindSafe(write).catch_unwind().await {
                Ok(result) => result.map_err(Into::into),
                Err(payload) => Err(QueryError::from_panic(payload)),
            },
            Err(payload) => Err(QueryError::from_panic(payload)),
        };

        match outcome {
            Ok(value) => {
                counter!(METRIC_MUTATION, "outcome" => "ok").increment(1);
                self.trigger.tags_invalidated(&options.revalidate_tags).await;
                Ok(value)
            }
            Err(error) => {
                counter!(METRIC_MUTATION, "outcome" => "error").increment(1);
                warn!(kind = ?error.kind, error = %error, "Mutation failed, cache left untouched");
                Err(error)
            }
        }
    }

    /// Invalidate without writing.
    pub async fn invalidate_tags(&self, tags: &[Tag]) {
        self.trigger.tags_invalidated(tags).await;
    }

    pub async fn invalidate_keys(&self, keys: &[CacheKey]) {
        self.trigger.keys_invalidated(keys).await;
    }

    pub fn trigger(&self) -> &Arc<CacheTrigger> {
        &self.trigger
    }
}

type MutateFn<P, T> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

#[derive(Default)]
struct MutationStatus {
    pending: AtomicUsize,
    last_error: Mutex<Option<QueryError>>,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self(pending)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A reusable write with fixed invalidation options and observable pending/error state.
pub struct Mutation<P, T> {
    executor: MutationExecutor,
    mutate: MutateFn<P, T>,
    options: MutateOptions,
    status: Arc<MutationStatus>,
}

impl<P, T> Clone for Mutation<P, T> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            mutate: Arc::clone(&self.mutate),
            options: self.options.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

impl<P, T> Mutation<P, T>
where
    P: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut, E>(executor: MutationExecutor, options: MutateOptions, mutate: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError>,
    {
        Self {
            executor,
            mutate: Arc::new(move |params| {
                mutate(params)
                    .map(|result| result.map_err(Into::into))
                    .boxed()
            }),
            options,
            status: Arc::default(),
        }
    }

    pub async fn trigger(&self, params: P) -> Result<T, QueryError> {
        let _pending = PendingGuard::enter(&self.status.pending);
        let mutate = Arc::clone(&self.mutate);
        let result = self
            .executor
            .execute(move |params| mutate(params), params, &self.options)
            .await;
        *mutex_lock(&self.status.last_error, SOURCE, "trigger") = result.as_ref().err().cloned();
        debug!(ok = result.is_ok(), "Mutation settled");
        result
    }

    pub fn is_mutating(&self) -> bool {
        self.status.pending.load(Ordering::SeqCst) > 0
    }

    pub fn last_error(&self) -> Option<QueryError> {
        mutex_lock(&self.status.last_error, SOURCE, "last_error").clone()
    }

    pub fn reset(&self) {
        *mutex_lock(&self.status.last_error, SOURCE, "reset") = None;
    }

    pub fn options(&self) -> &MutateOptions {
        &self.options
    }
}

impl<P, T> fmt::Debug for Mutation<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("options", &self.options)
            .field("pending", &self.status.pending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::application::error::ErrorKind;
    use crate::cache::{CacheConfig, CacheConsumer, CacheStore, ErasedData, EventQueue};

    fn executor(store: &Arc<CacheStore>) -> MutationExecutor {
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(
            CacheConfig::default(),
            Arc::clone(store),
            Arc::clone(&queue),
        ));
        MutationExecutor::new(Arc::new(CacheTrigger::new(queue, consumer)))
    }

    async fn seed(store: &Arc<CacheStore>, key: &str) -> CacheKey {
        let key = CacheKey::from(key);
        let tags = BTreeSet::from([Tag::new(key.base())]);
        store
            .begin_fetch(&key, &tags, false, std::time::Duration::from_secs(60), || {
                async { Ok(Arc::new(1_u8) as ErasedData) }.boxed()
            })
            .into_future()
            .expect("started")
            .await
            .expect("seeded");
        key
    }

    #[tokio::test]
    async fn success_invalidates_tagged_entries() {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        let key = seed(&store, "teams").await;
        let executor = executor(&store);

        let value = executor
            .execute(
                |name: String| async move { Ok::<_, QueryError>(name.len()) },
                "blue".to_string(),
                &MutateOptions::revalidate(["teams"]),
            )
            .await
            .expect("write ok");

        assert_eq!(value, 4);
        assert!(store.entry(&key).expect("entry").needs_revalidation);
    }

    #[tokio::test]
    async fn failure_and_panic_leave_cache_untouched() {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        let key = seed(&store, "posts").await;
        let executor = executor(&store);
        let options = MutateOptions::revalidate(["posts"]);

        let error = executor
            .execute(
                |_: ()| async { Err::<(), _>(QueryError::remote("constraint")) },
                (),
                &options,
            )
            .await
            .expect_err("write fails");
        assert_eq!(error.kind, ErrorKind::Remote);

        let error = executor
            .execute(
                |_: ()| async {
                    if true {
                        panic!("writer crashed");
                    }
                    Ok::<(), QueryError>(())
                },
                (),
                &options,
            )
            .await
            .expect_err("panic normalized");
        assert_eq!(error.kind, ErrorKind::Unexpected);
        assert!(!store.entry(&key).expect("entry").needs_revalidation);
    }

    #[tokio::test]
    async fn mutation_tracks_last_error() {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        let mutation = Mutation::new(
            executor(&store),
            MutateOptions::revalidate(["missions"]),
            |fail: bool| async move {
                if fail {
                    Err(QueryError::validation("title required"))
                } else {
                    Ok(())
                }
            },
        );

        assert!(mutation.trigger(true).await.is_err());
        assert!(mutation.last_error().is_some());
        assert!(!mutation.is_mutating());

        mutation.trigger(false).await.expect("ok");
        assert!(mutation.last_error().is_none());

        mutation.trigger(true).await.expect_err("fails again");
        mutation.reset();
        assert!(mutation.last_error().is_none());
    }
}
