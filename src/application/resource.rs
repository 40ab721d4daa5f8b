//! Generic CRUD surface for one named table.
//!
//! A [`Resource`] combines a cached list query tagged with the resource name and a set of
//! mutations that invalidate that tag, so every successful write sends mounted lists back
//! into validation.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::application::error::{CODE_NOT_FOUND, QueryError};
use crate::application::pagination::{Page, page_range};
use crate::application::remote::{Filter, Order, RemoteStore, SelectQuery};
use crate::cache::{CacheKey, KeyParams, Primitive, Tag, build_key};
use crate::query::{
    Fetcher, InfiniteQuery, MutateOptions, Mutation, MutationExecutor, QueryEngine, QueryHandle,
    QueryOptions,
};

/// Static description of a resource table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub name: String,
    pub primary_key: String,
    /// `*` or a comma-separated column list.
    pub projection: String,
    pub order: Option<Order>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            projection: "*".to_string(),
            order: None,
        }
    }

    pub fn projection(mut self, projection: impl Into<String>) -> Self {
        self.projection = projection.into();
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn tag(&self) -> Tag {
        Tag::new(self.name.as_str())
    }

    /// Unfiltered select over the table in the configured projection and order.
    pub fn select(&self) -> SelectQuery {
        let query = SelectQuery::from(self.name.as_str()).select(&self.projection);
        match &self.order {
            Some(order) => query.order(order.clone()),
            None => query,
        }
    }

    fn id_filter(&self, id: &Primitive) -> Result<Filter, QueryError> {
        if id.is_null() {
            return Err(QueryError::validation(format!(
                "{} requires a non-null `{}`",
                self.name, self.primary_key
            )));
        }
        Ok(Filter::Eq {
            column: self.primary_key.clone(),
            value: id.to_json(),
        })
    }

    fn not_found(&self, id: &Primitive) -> QueryError {
        QueryError::remote(format!("{} `{}` not found", self.name, id.to_json()))
            .with_code(CODE_NOT_FOUND)
    }
}

/// Fetches and decodes every row a select returns.
pub struct RowsFetcher<Row> {
    _row: PhantomData<fn() -> Row>,
}

impl<Row> RowsFetcher<Row> {
    pub fn new() -> Self {
        Self { _row: PhantomData }
    }
}

impl<Row> Default for RowsFetcher<Row> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Row> Fetcher<SelectQuery> for RowsFetcher<Row>
where
    Row: DeserializeOwned + Send + Sync + 'static,
{
    type Output = Vec<Row>;

    async fn fetch(
        &self,
        client: &dyn RemoteStore,
        query: &SelectQuery,
    ) -> Result<Vec<Row>, QueryError> {
        let selection = client.select(query).await?;
        decode_rows(selection.rows)
    }
}

fn decode_rows<Row: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<Row>, QueryError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(QueryError::from))
        .collect()
}

async fn insert_rows<Row, Insert>(
    remote: Arc<dyn RemoteStore>,
    spec: Arc<ResourceSpec>,
    rows: Vec<Insert>,
) -> Result<Vec<Row>, QueryError>
where
    Row: DeserializeOwned,
    Insert: Serialize,
{
    let payload = rows
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    let inserted = remote.insert(&spec.name, payload).await?;
    decode_rows(inserted)
}

async fn create_row<Row, Insert>(
    remote: Arc<dyn RemoteStore>,
    spec: Arc<ResourceSpec>,
    row: Insert,
) -> Result<Row, QueryError>
where
    Row: DeserializeOwned,
    Insert: Serialize,
{
    let mut rows = insert_rows(remote, spec, vec![row]).await?;
    rows.pop()
        .ok_or_else(|| QueryError::remote("insert returned no row"))
}

async fn update_row<Row, Update>(
    remote: &dyn RemoteStore,
    spec: &ResourceSpec,
    id: Primitive,
    patch: Update,
) -> Result<Row, QueryError>
where
    Row: DeserializeOwned,
    Update: Serialize,
{
    let filter = spec.id_filter(&id)?;
    let patch = serde_json::to_value(patch)?;
    let mut rows = remote.update(&spec.name, &[filter], patch).await?;
    match rows.pop() {
        Some(row) => Ok(serde_json::from_value(row)?),
        None => Err(spec.not_found(&id)),
    }
}

async fn update_one<Row, Update>(
    remote: Arc<dyn RemoteStore>,
    spec: Arc<ResourceSpec>,
    id: Primitive,
    patch: Update,
) -> Result<Row, QueryError>
where
    Row: DeserializeOwned,
    Update: Serialize,
{
    update_row(remote.as_ref(), &spec, id, patch).await
}

/// Sequential patches. A failure after at least one committed row still invalidates the
/// resource tag before the error is returned, since the executor skips invalidation on errors.
async fn update_rows<Row, Update>(
    remote: Arc<dyn RemoteStore>,
    executor: MutationExecutor,
    spec: Arc<ResourceSpec>,
    items: Vec<(Primitive, Update)>,
) -> Result<Vec<Row>, QueryError>
where
    Row: DeserializeOwned,
    Update: Serialize,
{
    let mut updated = Vec::with_capacity(items.len());
    for (id, patch) in items {
        match update_row(remote.as_ref(), &spec, id, patch).await {
            Ok(row) => updated.push(row),
            Err(error) => {
                if !updated.is_empty() {
                    debug!(
                        resource = %spec.name,
                        committed = updated.len(),
                        "Bulk update failed after partial commit"
                    );
                    executor.invalidate_tags(&[spec.tag()]).await;
                }
                return Err(error);
            }
        }
    }
    Ok(updated)
}

async fn delete_rows(
    remote: Arc<dyn RemoteStore>,
    spec: Arc<ResourceSpec>,
    ids: Vec<Primitive>,
) -> Result<(), QueryError> {
    let filter = match ids.as_slice() {
        [id] => spec.id_filter(id)?,
        _ => {
            let values = ids
                .iter()
                .map(|id| spec.id_filter(id).map(|_| id.to_json()))
                .collect::<Result<Vec<_>, _>>()?;
            Filter::In {
                column: spec.primary_key.clone(),
                values,
            }
        }
    };
    let removed = remote.delete(&spec.name, &[filter]).await?;
    debug!(resource = %spec.name, removed = removed.len(), "Deleted rows");
    Ok(())
}

async fn fetch_page<Row: DeserializeOwned>(
    remote: Arc<dyn RemoteStore>,
    query: SelectQuery,
    index: u64,
    size: u64,
) -> Result<Page<Row>, QueryError> {
    let (from, to) = page_range(index, size);
    let selection = remote.select(&query.range(from, to).with_count()).await?;
    let rows: Vec<Row> = decode_rows(selection.rows)?;
    Ok(match selection.count {
        Some(total) => Page::from_offset(rows, index, size, total),
        None => {
            // no exact count: a full page suggests more rows
            let fetched = rows.len() as u64;
            let next_cursor = (fetched >= size).then_some(index + 1);
            Page::new(rows, next_cursor, from + fetched)
        }
    })
}

/// Cached list queries plus invalidating mutations for one table.
pub struct Resource<Row, Insert, Update> {
    spec: Arc<ResourceSpec>,
    engine: QueryEngine,
    remote: Arc<dyn RemoteStore>,
    fetcher: Arc<RowsFetcher<Row>>,
    create: Mutation<Insert, Row>,
    update: Mutation<(Primitive, Update), Row>,
    remove: Mutation<Vec<Primitive>, ()>,
    bulk_create: Mutation<Vec<Insert>, Vec<Row>>,
    bulk_update: Mutation<Vec<(Primitive, Update)>, Vec<Row>>,
}

impl<Row, Insert, Update> Clone for Resource<Row, Insert, Update> {
    fn clone(&self) -> Self {
        Self {
            spec: Arc::clone(&self.spec),
            engine: self.engine.clone(),
            remote: Arc::clone(&self.remote),
            fetcher: Arc::clone(&self.fetcher),
            create: self.create.clone(),
            update: self.update.clone(),
            remove: self.remove.clone(),
            bulk_create: self.bulk_create.clone(),
            bulk_update: self.bulk_update.clone(),
        }
    }
}

impl<Row, Insert, Update> fmt::Debug for Resource<Row, Insert, Update> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Build the CRUD surface for `spec`. Every mutation revalidates the resource's tag.
pub fn build_resource<Row, Insert, Update>(
    engine: &QueryEngine,
    executor: &MutationExecutor,
    remote: Arc<dyn RemoteStore>,
    spec: ResourceSpec,
) -> Resource<Row, Insert, Update>
where
    Row: DeserializeOwned + Send + Sync + 'static,
    Insert: Serialize + Send + Sync + 'static,
    Update: Serialize + Send + Sync + 'static,
{
    let spec = Arc::new(spec);
    let options = MutateOptions::revalidate([spec.tag()]);

    let create = {
        let (remote, spec) = (Arc::clone(&remote), Arc::clone(&spec));
        Mutation::new(executor.clone(), options.clone(), move |row: Insert| {
            create_row::<Row, Insert>(Arc::clone(&remote), Arc::clone(&spec), row)
        })
    };
    let bulk_create = {
        let (remote, spec) = (Arc::clone(&remote), Arc::clone(&spec));
        Mutation::new(executor.clone(), options.clone(), move |rows: Vec<Insert>| {
            insert_rows::<Row, Insert>(Arc::clone(&remote), Arc::clone(&spec), rows)
        })
    };
    let update = {
        let (remote, spec) = (Arc::clone(&remote), Arc::clone(&spec));
        Mutation::new(
            executor.clone(),
            options.clone(),
            move |(id, patch): (Primitive, Update)| {
                update_one::<Row, Update>(Arc::clone(&remote), Arc::clone(&spec), id, patch)
            },
        )
    };
    let bulk_update = {
        let (remote, spec, committer) = (Arc::clone(&remote), Arc::clone(&spec), executor.clone());
        Mutation::new(
            executor.clone(),
            options.clone(),
            move |items: Vec<(Primitive, Update)>| {
                update_rows::<Row, Update>(
                    Arc::clone(&remote),
                    committer.clone(),
                    Arc::clone(&spec),
                    items,
                )
            },
        )
    };
    let remove = {
        let (remote, spec) = (Arc::clone(&remote), Arc::clone(&spec));
        Mutation::new(executor.clone(), options, move |ids: Vec<Primitive>| {
            delete_rows(Arc::clone(&remote), Arc::clone(&spec), ids)
        })
    };

    Resource {
        spec,
        engine: engine.clone(),
        remote,
        fetcher: Arc::new(RowsFetcher::new()),
        create,
        update,
        remove,
        bulk_create,
        bulk_update,
    }
}

impl<Row, Insert, Update> Resource<Row, Insert, Update>
where
    Row: DeserializeOwned + Send + Sync + 'static,
    Insert: Serialize + Send + Sync + 'static,
    Update: Serialize + Send + Sync + 'static,
{
    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    fn query_options(&self) -> QueryOptions {
        self.engine.defaults().clone().with_tags([self.spec.tag()])
    }

    fn filtered(&self, params: &KeyParams) -> SelectQuery {
        params
            .canonical()
            .into_iter()
            .fold(self.spec.select(), |query, (column, value)| {
                query.eq(column, value.to_json())
            })
    }

    /// Every row, cached under the resource name.
    pub fn list(&self) -> QueryHandle<Vec<Row>> {
        self.engine.use_fetcher(
            Some(CacheKey::new(self.spec.name.as_str())),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.remote),
            self.spec.select(),
            self.query_options(),
        )
    }

    /// Rows matching equality conditions. `None` disables the query until conditions exist.
    pub fn list_where(&self, conditions: impl Into<Option<KeyParams>>) -> QueryHandle<Vec<Row>> {
        let conditions = conditions.into();
        let key = conditions
            .as_ref()
            .map(|params| build_key(&self.spec.name, params));
        let query = match &conditions {
            Some(params) => self.filtered(params),
            None => self.spec.select(),
        };
        self.engine.use_fetcher(
            key,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.remote),
            query,
            self.query_options(),
        )
    }

    /// Paginated rows matching `conditions`; each page is cached under
    /// `{...conditions, page, size}`.
    pub fn list_paginated(&self, conditions: KeyParams, page_size: u64) -> InfiniteQuery<Row> {
        let page_size = page_size.max(1);
        let name = self.spec.name.clone();
        let query = self.filtered(&conditions);
        let remote = Arc::clone(&self.remote);

        self.engine.use_infinite_query_with(
            move |index: usize, _previous: Option<&Page<Row>>| {
                let params = conditions
                    .clone()
                    .with("page", index)
                    .with("size", page_size);
                Some(build_key(&name, &params))
            },
            move |index: usize, size: u64| {
                fetch_page::<Row>(Arc::clone(&remote), query.clone(), index as u64, size)
            },
            page_size,
            self.query_options(),
        )
    }

    /// One row by primary key, bypassing the cache.
    pub async fn get_by_id(&self, id: impl Into<Primitive>) -> Result<Option<Row>, QueryError> {
        let filter = self.spec.id_filter(&id.into())?;
        let mut query = self.spec.select().range(0, 0);
        query.filters.push(filter);
        let selection = self.remote.select(&query).await?;
        let mut rows: Vec<Row> = decode_rows(selection.rows)?;
        Ok(rows.pop())
    }

    pub async fn create(&self, row: Insert) -> Result<Row, QueryError> {
        self.create.trigger(row).await
    }

    /// Patch one row. A missing row is a remote error with code `NOT_FOUND`.
    pub async fn update(&self, id: impl Into<Primitive>, patch: Update) -> Result<Row, QueryError> {
        self.update.trigger((id.into(), patch)).await
    }

    pub async fn remove(&self, id: impl Into<Primitive>) -> Result<(), QueryError> {
        self.remove.trigger(vec![id.into()]).await
    }

    pub async fn bulk_create(&self, rows: Vec<Insert>) -> Result<Vec<Row>, QueryError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.bulk_create.trigger(rows).await
    }

    /// Patches apply in order; the first failure stops the batch. Rows already patched stay
    /// committed and mounted lists are revalidated before the error is returned.
    pub async fn bulk_update<I>(
        &self,
        items: impl IntoIterator<Item = (I, Update)>,
    ) -> Result<Vec<Row>, QueryError>
    where
        I: Into<Primitive>,
    {
        let items: Vec<(Primitive, Update)> = items
            .into_iter()
            .map(|(id, patch)| (id.into(), patch))
            .collect();
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.bulk_update.trigger(items).await
    }

    pub async fn bulk_remove<I>(&self, ids: impl IntoIterator<Item = I>) -> Result<(), QueryError>
    where
        I: Into<Primitive>,
    {
        let ids: Vec<Primitive> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.remove.trigger(ids).await
    }

    pub fn is_mutating(&self) -> bool {
        self.create.is_mutating()
            || self.update.is_mutating()
            || self.remove.is_mutating()
            || self.bulk_create.is_mutating()
            || self.bulk_update.is_mutating()
    }
}
