mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use journeyhub::application::error::{ErrorKind, QueryError};
use journeyhub::application::remote::Order;
use journeyhub::application::resource::ResourceSpec;
use journeyhub::cache::{CacheKey, KeyParams, Tag, build_key};
use journeyhub::query::QueryStatus;
use serde_json::Value;

use support::{client_with, seeded_missions, yield_a_little};

fn missions() -> ResourceSpec {
    ResourceSpec::new("missions", "id").order_by(Order::asc("seq"))
}

#[tokio::test]
async fn concurrent_mounts_share_one_fetch() {
    let store = seeded_missions(3).await;
    let client = client_with(&store);
    let resource = client.resource::<Value, Value, Value>(missions());

    store.close();
    let mut first = resource.list();
    let mut second = resource.list();
    yield_a_little().await;
    assert!(first.is_loading());
    assert!(second.is_loading());
    store.open();

    let a = first.settled().await;
    let b = second.settled().await;

    assert_eq!(store.selects(), 1);
    assert_eq!(a.data.map(|rows| rows.len()), Some(3));
    assert_eq!(b.data.map(|rows| rows.len()), Some(3));
}

#[tokio::test]
async fn remount_serves_cached_rows() {
    let store = seeded_missions(2).await;
    let client = client_with(&store);
    let resource = client.resource::<Value, Value, Value>(missions());

    let mut handle = resource.list();
    handle.settled().await;
    drop(handle);

    // unsubscribing keeps the entry
    assert!(client.store().entry(&CacheKey::new("missions")).is_some());

    let remounted = resource.list();
    assert!(!remounted.is_validating());
    assert_eq!(remounted.data().map(|rows| rows.len()), Some(2));
    assert_eq!(store.selects(), 1);
}

#[tokio::test]
async fn conditions_key_distinct_entries() {
    let store = seeded_missions(4).await;
    let client = client_with(&store);
    let resource = client.resource::<Value, Value, Value>(missions());

    let mut odd = resource.list_where(KeyParams::new().with("week_id", 1));
    let mut even = resource.list_where(KeyParams::new().with("week_id", 2));
    let odd = odd.settled().await;
    let even = even.settled().await;

    assert_eq!(store.selects(), 2);
    let odd = odd.data.expect("week 1 rows");
    assert_eq!(odd.len(), 2);
    assert!(odd.iter().all(|row| row["week_id"] == 1));
    assert_eq!(even.data.map(|rows| rows.len()), Some(2));

    let key = build_key("missions", &KeyParams::new().with("week_id", 1));
    assert!(client.store().entry(&key).is_some());
}

#[tokio::test]
async fn missing_conditions_disable_the_query() {
    let store = seeded_missions(1).await;
    let client = client_with(&store);
    let resource = client.resource::<Value, Value, Value>(missions());

    let handle = resource.list_where(None);
    yield_a_little().await;

    assert_eq!(handle.status(), QueryStatus::Disabled);
    assert_eq!(store.selects(), 0);
    let error = handle.refetch().await.expect_err("disabled refetch");
    assert_eq!(error.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn failed_refetch_keeps_previous_rows() {
    let store = seeded_missions(2).await;
    let client = client_with(&store);
    let resource = client.resource::<Value, Value, Value>(missions());

    let mut handle = resource.list();
    handle.settled().await;

    store.fail_next_selects(1);
    let error = handle.refetch().await.expect_err("transport failure");
    assert_eq!(error.kind, ErrorKind::Network);

    let state = handle.state();
    assert_eq!(state.data.map(|rows| rows.len()), Some(2));
    assert_eq!(state.error.map(|error| error.kind), Some(ErrorKind::Network));
    assert_eq!(handle.status(), QueryStatus::Error);
}

#[tokio::test]
async fn tags_match_exactly() {
    let store = seeded_missions(0).await;
    let client = client_with(&store);
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = Arc::clone(&calls);
    let options = client.engine().defaults().clone().with_tags(["teams-data"]);
    let mut handle = client.engine().use_query_with(
        Some(CacheKey::new("roster")),
        move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, QueryError>(vec!["ada", "grace"])
            }
        },
        options,
    );
    handle.settled().await;

    client.executor().invalidate_tags(&[Tag::from("team")]).await;
    yield_a_little().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!handle.is_validating());

    client.executor().invalidate_tags(&[Tag::from("teams-data")]).await;
    handle.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
