use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::application::error::QueryError;
use crate::cache::{CacheKey, CacheStore, SubscriberId, Tag};

use super::engine::{ErasedFetch, resolve, revalidator, start_fetch, type_mismatch};
use super::options::QueryOptions;

/// Snapshot of a mounted query.
pub struct QueryState<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    /// No data for the current key yet and a fetch is running.
    pub is_loading: bool,
    pub is_validating: bool,
}

impl<T> QueryState<T> {
    fn disabled() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_validating: false,
        }
    }
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            is_validating: self.is_validating,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_loading", &self.is_loading)
            .field("is_validating", &self.is_validating)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No key: nothing is fetched.
    Disabled,
    Idle,
    Validating,
    Error,
}

struct Mount {
    key: CacheKey,
    tags: BTreeSet<Tag>,
    subscriber: SubscriberId,
    changes: watch::Receiver<u64>,
}

/// A mounted query. Subscribed to its cache entry until dropped.
pub struct QueryHandle<T> {
    store: Arc<CacheStore>,
    fetch: ErasedFetch,
    options: QueryOptions,
    mount: Option<Mount>,
    previous: Option<Arc<T>>,
}

impl<T> QueryHandle<T> {
    fn detach(&mut self) {
        if let Some(mount) = self.mount.take() {
            self.store.unsubscribe(&mount.key, mount.subscriber);
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.mount.as_ref().map(|mount| &mount.key)
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.mount.is_some()
    }
}

impl<T: Send + Sync + 'static> QueryHandle<T> {
    pub(crate) fn mount(
        store: Arc<CacheStore>,
        fetch: ErasedFetch,
        options: QueryOptions,
        key: Option<CacheKey>,
    ) -> Self {
        let mut handle = Self {
            store,
            fetch,
            options,
            mount: None,
            previous: None,
        };
        if let Some(key) = key {
            handle.attach(key);
        }
        handle
    }

    fn attach(&mut self, key: CacheKey) {
        let tags = self.options.tags_for(&key);
        let revalidate = revalidator(
            Arc::downgrade(&self.store),
            key.clone(),
            tags.clone(),
            Arc::clone(&self.fetch),
            self.options.clone(),
        );
        let (subscriber, changes) = self.store.subscribe(&key, &tags, revalidate);
        start_fetch(&self.store, &key, &tags, &self.fetch, &self.options, false);
        self.mount = Some(Mount {
            key,
            tags,
            subscriber,
            changes,
        });
    }

    pub fn state(&self) -> QueryState<T> {
        let Some(mount) = &self.mount else {
            return QueryState::disabled();
        };
        let Some(view) = self.store.read(&mount.key) else {
            return QueryState::disabled();
        };

        let mut error = view.error;
        let data = match view.data.map(|erased| erased.downcast::<T>()) {
            Some(Ok(data)) => Some(data),
            Some(Err(_)) => {
                error = Some(type_mismatch(&mount.key));
                None
            }
            None => None,
        };
        let is_loading = data.is_none() && view.is_validating;
        // previous key's data covers the gap until the new key settles
        let data = match data {
            Some(data) => Some(data),
            None if self.options.keep_previous_data && error.is_none() => self.previous.clone(),
            None => None,
        };

        QueryState {
            data,
            error,
            is_loading,
            is_validating: view.is_validating,
        }
    }

    pub fn status(&self) -> QueryStatus {
        if self.mount.is_none() {
            return QueryStatus::Disabled;
        }
        let state = self.state();
        if state.is_validating {
            QueryStatus::Validating
        } else if state.error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Idle
        }
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.state().data
    }

    pub fn error(&self) -> Option<QueryError> {
        self.state().error
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    pub fn is_validating(&self) -> bool {
        self.state().is_validating
    }

    /// Force a fresh fetch of the current key. Joins a fetch already in flight.
    pub async fn refetch(&self) -> Result<Arc<T>, QueryError> {
        let Some(mount) = &self.mount else {
            return Err(QueryError::validation("query is disabled: no cache key"));
        };
        let fetch = start_fetch(
            &self.store,
            &mount.key,
            &mount.tags,
            &self.fetch,
            &self.options,
            true,
        );
        let data = resolve(&self.store, &mount.key, fetch).await?;
        data.downcast::<T>().map_err(|_| type_mismatch(&mount.key))
    }

    /// Move the subscription to another key. `None` disables the query.
    pub fn set_key(&mut self, key: Option<CacheKey>) {
        if self.key() == key.as_ref() {
            return;
        }
        if self.options.keep_previous_data {
            if let Some(data) = self.state().data {
                self.previous = Some(data);
            }
        } else {
            self.previous = None;
        }
        self.detach();
        if let Some(key) = key {
            self.attach(key);
        }
    }

    /// Wait for the next change to the entry. `false` when disabled or the entry is gone.
    pub async fn changed(&mut self) -> bool {
        match self.mount.as_mut() {
            Some(mount) => mount.changes.changed().await.is_ok(),
            None => false,
        }
    }

    /// Wait until no fetch is running for the current key.
    pub async fn settled(&mut self) -> QueryState<T> {
        loop {
            let state = self.state();
            if !state.is_validating || !self.changed().await {
                return self.state();
            }
        }
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T> fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key())
            .field("previous", &self.previous.is_some())
            .finish_non_exhaustive()
    }
}
