//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use journeyhub::application::context::QueryClient;
use journeyhub::application::remote::{
    Filter, RemoteStore, SelectQuery, Selection, StoreError,
};
use journeyhub::cache::CacheConfig;
use journeyhub::infra::memory::InMemoryStore;
use serde_json::{Value, json};
use tokio::sync::watch;

/// In-memory store that counts calls and can fail selects. A closed gate holds select
/// responses after the rows were read, so writes can land while a fetch is in flight.
pub struct ProbeStore {
    inner: InMemoryStore,
    selects: AtomicUsize,
    writes: AtomicUsize,
    failing_selects: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl ProbeStore {
    pub fn new(inner: InMemoryStore) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner,
            selects: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failing_selects: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn selects(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Hold every select response until [`ProbeStore::open`].
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Fail the next `count` selects with a transport error.
    pub fn fail_next_selects(&self, count: usize) {
        self.failing_selects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for ProbeStore {
    async fn select(&self, query: &SelectQuery) -> Result<Selection, StoreError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        // rows are read on arrival; only the response waits at the gate
        let selection = self.inner.select(query).await;
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let failing = self
            .failing_selects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Transport("connection reset".into()));
        }
        selection
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(table, rows).await
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(table, filters, patch).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(table, filters).await
    }
}

/// Cache settings for tests: no retries, a short dedup window.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        deduping_interval_ms: 50,
        error_retry_count: 0,
        error_retry_interval_ms: 10,
        ..CacheConfig::default()
    }
}

pub fn client_with(store: &Arc<ProbeStore>) -> QueryClient {
    QueryClient::new(test_config(), Arc::clone(store) as Arc<dyn RemoteStore>)
}

/// `missions` with `count` rows, `seq` running from 0.
pub async fn seeded_missions(count: usize) -> Arc<ProbeStore> {
    let inner = InMemoryStore::new().with_table("missions", "id");
    let rows = (0..count)
        .map(|seq| json!({ "seq": seq, "week_id": 1 + seq % 2, "title": format!("Mission {seq}") }))
        .collect::<Vec<_>>();
    if !rows.is_empty() {
        inner.insert("missions", rows).await.expect("seed missions");
    }
    Arc::new(ProbeStore::new(inner))
}

/// Let spawned fetches make progress.
pub async fn yield_a_little() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
