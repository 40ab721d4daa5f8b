use async_trait::async_trait;

use crate::application::error::QueryError;
use crate::application::remote::RemoteStore;

/// Typed fetch against the remote store: `params` in, `Output` out.
///
/// Mounted through [`QueryEngine::use_fetcher`](super::QueryEngine::use_fetcher), which
/// supplies the client and owns the parameters for the lifetime of the query.
#[async_trait]
pub trait Fetcher<P>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    type Output: Send + Sync + 'static;

    async fn fetch(&self, client: &dyn RemoteStore, params: &P) -> Result<Self::Output, QueryError>;
}
