//! JourneyHub Cache System
//!
//! Keyed storage for query results shared by every hook of one client:
//!
//! - **Keys**: canonical `base:{params}` identities built by [`build_key`]
//! - **Store**: entries, subscribers, in-flight fetch dedup and optional LRU bound
//! - **Invalidation**: tag/key events queued, planned and applied by the consumer
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `journeyhub.toml`:
//!
//! ```toml
//! [cache]
//! deduping_interval_ms = 60000
//! error_retry_count = 3
//! error_retry_interval_ms = 5000
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod events;
mod keys;
mod lock;
mod planner;
mod registry;
mod store;
mod trigger;

pub use config::CacheConfig;
pub use consumer::CacheConsumer;
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use keys::{CacheKey, KeyParams, Primitive, Tag, build_key};
pub use planner::InvalidationPlan;
pub use registry::CacheRegistry;
pub use store::{
    CacheEntry, CacheStore, ErasedData, Fetch, FetchFuture, FetchResult, Revalidator,
    SubscriberId,
};
pub use trigger::CacheTrigger;

pub(crate) use lock::mutex_lock;
