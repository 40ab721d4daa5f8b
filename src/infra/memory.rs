//! In-process remote store over JSON rows.
//!
//! Same filter, order, range and count semantics as the Postgres adapter, with values
//! compared by their text form. Used by tests and local tooling.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::remote::{
    Filter, Order, Projection, RemoteStore, SelectQuery, Selection, StoreError,
};

struct Table {
    primary_key: String,
    rows: Vec<Map<String, Value>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

fn text_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn matches(row: &Map<String, Value>, filter: &Filter) -> bool {
    let cell = row.get(filter.column()).and_then(text_form);
    match filter {
        Filter::Eq { value, .. } => cell == text_form(value),
        Filter::In { values, .. } => {
            cell.is_some_and(|cell| values.iter().filter_map(text_form).any(|value| value == cell))
        }
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        // nulls sort last ascending, as in Postgres
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

fn sort_rows(rows: &mut [&Map<String, Value>], order: &[Order]) {
    rows.sort_by(|a, b| {
        for clause in order {
            let left = a.get(&clause.column).unwrap_or(&Value::Null);
            let right = b.get(&clause.column).unwrap_or(&Value::Null);
            let ordering = if clause.ascending {
                compare(left, right)
            } else {
                compare(right, left)
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(row: &Map<String, Value>, projection: &Projection) -> Value {
    match projection {
        Projection::All => Value::Object(row.clone()),
        Projection::Columns(columns) => Value::Object(
            columns
                .iter()
                .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
                .collect(),
        ),
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty table. Inserted rows without `primary_key` get a UUID v4.
    pub fn with_table(self, name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        self.create_table(name, primary_key);
        self
    }

    pub fn create_table(&self, name: impl Into<String>, primary_key: impl Into<String>) {
        let mut tables = self.write();
        tables.entry(name.into()).or_insert_with(|| Table {
            primary_key: primary_key.into(),
            rows: Vec::new(),
        });
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.read()
            .get(table)
            .map(|table| table.rows.len())
            .unwrap_or(0)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Table>> {
        self.tables.read().unwrap_or_else(|poisoned| {
            warn!(target_module = "infra::memory", "Recovered from poisoned table lock");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Table>> {
        self.tables.write().unwrap_or_else(|poisoned| {
            warn!(target_module = "infra::memory", "Recovered from poisoned table lock");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn select(&self, query: &SelectQuery) -> Result<Selection, StoreError> {
        let tables = self.read();
        let table = tables
            .get(&query.table)
            .ok_or_else(|| StoreError::UnknownTable(query.table.clone()))?;

        let mut rows: Vec<&Map<String, Value>> = table
            .rows
            .iter()
            .filter(|row| query.filters.iter().all(|filter| matches(row, filter)))
            .collect();
        let count = query.count.then_some(rows.len() as u64);
        sort_rows(&mut rows, &query.order);

        let selected: Vec<Value> = match query.range {
            Some((from, to)) => {
                let take = if to < from { 0 } else { (to - from + 1) as usize };
                rows.iter()
                    .skip(from as usize)
                    .take(take)
                    .map(|row| project(row, &query.projection))
                    .collect()
            }
            None => rows.iter().map(|row| project(row, &query.projection)).collect(),
        };

        debug!(table = %query.table, rows = selected.len(), ?count, "Selected in-memory rows");
        Ok(Selection {
            rows: selected,
            count,
        })
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        let mut tables = self.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let Value::Object(mut fields) = row else {
                return Err(StoreError::invalid_request("inserted rows must be JSON objects"));
            };
            let key = fields
                .entry(target.primary_key.clone())
                .or_insert(Value::Null);
            if key.is_null() {
                *key = Value::String(Uuid::new_v4().to_string());
            }
            let id = text_form(key);
            let duplicate = target
                .rows
                .iter()
                .chain(prepared.iter())
                .any(|existing| existing.get(&target.primary_key).and_then(text_form) == id);
            if duplicate {
                return Err(StoreError::Duplicate {
                    constraint: format!("{table}_pkey"),
                });
            }
            prepared.push(fields);
        }

        let inserted = prepared.iter().cloned().map(Value::Object).collect();
        target.rows.extend(prepared);
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        if filters.is_empty() {
            return Err(StoreError::invalid_request("refusing to update without a filter"));
        }
        let Value::Object(patch) = patch else {
            return Err(StoreError::invalid_request("patch must be a JSON object"));
        };
        let mut tables = self.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let mut updated = Vec::new();
        for row in target
            .rows
            .iter_mut()
            .filter(|row| filters.iter().all(|filter| matches(row, filter)))
        {
            for (column, value) in &patch {
                row.insert(column.clone(), value.clone());
            }
            updated.push(Value::Object(row.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        if filters.is_empty() {
            return Err(StoreError::invalid_request("refusing to delete without a filter"));
        }
        let mut tables = self.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut target.rows)
            .into_iter()
            .partition(|row| filters.iter().all(|filter| matches(row, filter)));
        target.rows = kept;
        Ok(removed.into_iter().map(Value::Object).collect())
    }
}
