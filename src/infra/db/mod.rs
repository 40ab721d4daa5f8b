//! Postgres-backed remote store.

mod sql;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::JsonValue,
};
use tracing::{debug, instrument};

use crate::application::remote::{Filter, RemoteStore, SelectQuery, Selection, StoreError};

#[derive(Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }

    fn convert_count(value: i64) -> Result<u64, StoreError> {
        value
            .try_into()
            .map_err(|_| StoreError::from_persistence("count exceeds supported range"))
    }

    fn into_rows(value: JsonValue) -> Result<Vec<Value>, StoreError> {
        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(StoreError::Decode(format!(
                "expected a JSON array of rows, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for PostgresStore {
    #[instrument(skip_all, fields(table = %query.table, count = query.count))]
    async fn select(&self, query: &SelectQuery) -> Result<Selection, StoreError> {
        let mut rows_qb = sql::select_rows(query)?;
        let rows = rows_qb
            .build_query_scalar::<JsonValue>()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        let rows = Self::into_rows(rows)?;

        let count = if query.count {
            let mut count_qb = sql::count_rows(query)?;
            let total = count_qb
                .build_query_scalar::<i64>()
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            Some(Self::convert_count(total)?)
        } else {
            None
        };

        debug!(rows = rows.len(), ?count, "Selected rows");
        Ok(Selection { rows, count })
    }

    #[instrument(skip_all, fields(table = table, rows = rows.len()))]
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = sql::insert_rows(table, rows)?;
        qb.build_query_scalar::<JsonValue>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    #[instrument(skip_all, fields(table = table, filters = filters.len()))]
    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        let mut qb = sql::update_rows(table, filters, patch)?;
        qb.build_query_scalar::<JsonValue>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    #[instrument(skip_all, fields(table = table, filters = filters.len()))]
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        let mut qb = sql::delete_rows(table, filters)?;
        qb.build_query_scalar::<JsonValue>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }
}
