//! Reactive queries over the cache store.
//!
//! [`QueryEngine`] mounts single-resource queries ([`QueryHandle`]) and cursor-paginated
//! lists ([`InfiniteQuery`]); [`MutationExecutor`] runs writes and invalidates the tags they
//! touch so mounted handles refetch.

mod engine;
mod fetcher;
mod handle;
mod infinite;
mod mutation;
mod options;

pub use engine::QueryEngine;
pub use fetcher::Fetcher;
pub use handle::{QueryHandle, QueryState, QueryStatus};
pub use infinite::InfiniteQuery;
pub use mutation::{MutateOptions, Mutation, MutationExecutor};
pub use options::QueryOptions;
