//! Bootstrap object wiring the cache store, engine and mutation executor.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::application::remote::RemoteStore;
use crate::application::resource::{Resource, ResourceSpec, build_resource};
use crate::cache::{CacheConfig, CacheConsumer, CacheStore, CacheTrigger, EventQueue};
use crate::query::{MutationExecutor, QueryEngine, QueryOptions};

/// One cache store shared by every query and mutation created through this client.
#[derive(Clone)]
pub struct QueryClient {
    config: CacheConfig,
    store: Arc<CacheStore>,
    queue: Arc<EventQueue>,
    trigger: Arc<CacheTrigger>,
    engine: QueryEngine,
    executor: MutationExecutor,
    remote: Arc<dyn RemoteStore>,
}

impl QueryClient {
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> Self {
        let store = Arc::new(CacheStore::new(&config));
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&queue),
        ));
        let trigger = Arc::new(CacheTrigger::new(Arc::clone(&queue), consumer));
        let engine = QueryEngine::new(Arc::clone(&store), QueryOptions::from(&config));
        let executor = MutationExecutor::new(Arc::clone(&trigger));

        Self {
            config,
            store,
            queue,
            trigger,
            engine,
            executor,
            remote,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn trigger(&self) -> &Arc<CacheTrigger> {
        &self.trigger
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn executor(&self) -> &MutationExecutor {
        &self.executor
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn resource<Row, Insert, Update>(&self, spec: ResourceSpec) -> Resource<Row, Insert, Update>
    where
        Row: DeserializeOwned + Send + Sync + 'static,
        Insert: Serialize + Send + Sync + 'static,
        Update: Serialize + Send + Sync + 'static,
    {
        build_resource(&self.engine, &self.executor, Arc::clone(&self.remote), spec)
    }

    /// Drop pending events and every cached entry. Fetches still in flight land nowhere.
    pub fn teardown(&self) {
        let pending = self.queue.len();
        self.queue.clear();
        let entries = self.store.len();
        self.store.clear();
        info!(pending, entries, "Query client torn down");
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.config)
            .field("entries", &self.store.len())
            .finish_non_exhaustive()
    }
}
