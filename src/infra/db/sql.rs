//! SQL builders for the generic table operations.
//!
//! Rows travel as JSON in both directions: selects aggregate `to_jsonb` rows into one ordered array,
//! writes go through `json_populate_record(set)` so column types come from the table itself.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::application::remote::{Filter, Projection, SelectQuery, StoreError};

/// Alias of the written row in insert/update/delete statements.
const ROW_ALIAS: &str = "r";

pub(crate) fn quote_ident(ident: &str) -> Result<String, StoreError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || ident.len() > 63 {
        return Err(StoreError::invalid_request(format!(
            "invalid identifier `{ident}`"
        )));
    }
    Ok(format!("\"{ident}\""))
}

/// Text form of a JSON scalar as Postgres renders `column::text`.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

fn push_columns(qb: &mut QueryBuilder<'static, Postgres>, projection: &Projection) -> Result<(), StoreError> {
    match projection {
        Projection::All => {
            qb.push("*");
        }
        Projection::Columns(columns) => {
            let quoted = columns
                .iter()
                .map(|column| quote_ident(column))
                .collect::<Result<Vec<_>, _>>()?;
            qb.push(quoted.join(", "));
        }
    }
    Ok(())
}

fn push_filters(
    qb: &mut QueryBuilder<'static, Postgres>,
    filters: &[Filter],
    qualifier: Option<&str>,
) -> Result<(), StoreError> {
    for (position, filter) in filters.iter().enumerate() {
        qb.push(if position == 0 { " WHERE " } else { " AND " });
        let column = quote_ident(filter.column())?;
        let column = match qualifier {
            Some(alias) => format!("{alias}.{column}"),
            None => column,
        };
        match filter {
            Filter::Eq { value, .. } => match text_value(value) {
                Some(text) => {
                    qb.push(format!("{column}::text = "));
                    qb.push_bind(text);
                }
                None => {
                    qb.push(format!("{column} IS NULL"));
                }
            },
            Filter::In { values, .. } => {
                let texts: Vec<String> = values.iter().filter_map(text_value).collect();
                qb.push(format!("{column}::text = ANY("));
                qb.push_bind(texts);
                qb.push(")");
            }
        }
    }
    Ok(())
}

/// Window-numbered position of a row inside the ordered selection; stripped from the output.
const POSITION_COLUMN: &str = "__row_position";

/// `SELECT` returning every matching row as one JSON array.
///
/// Aggregation order is pinned with `ORDER BY` inside `jsonb_agg`; the position column carries
/// the requested ordering out of the subquery even when the projection omits the sort columns.
pub(crate) fn select_rows(query: &SelectQuery) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let table = quote_ident(&query.table)?;
    let mut order_by = Vec::with_capacity(query.order.len());
    for order in &query.order {
        let direction = if order.ascending { "ASC" } else { "DESC" };
        order_by.push(format!("{} {direction}", quote_ident(&order.column)?));
    }
    let window = if order_by.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", order_by.join(", "))
    };

    let mut qb = QueryBuilder::new(format!(
        "SELECT COALESCE(jsonb_agg(to_jsonb(t) - '{POSITION_COLUMN}' ORDER BY t.\"{POSITION_COLUMN}\"), \
         '[]'::jsonb) FROM (SELECT "
    ));
    push_columns(&mut qb, &query.projection)?;
    qb.push(format!(", row_number() OVER ({window}) AS \"{POSITION_COLUMN}\" FROM {table}"));
    push_filters(&mut qb, &query.filters, None)?;
    qb.push(format!(" ORDER BY \"{POSITION_COLUMN}\""));

    if let Some((from, to)) = query.range {
        let limit = if to < from { 0 } else { to - from + 1 };
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(from).unwrap_or(i64::MAX));
    }

    qb.push(") t");
    Ok(qb)
}

/// `SELECT COUNT(*)` over the filtered table, ignoring range and order.
pub(crate) fn count_rows(query: &SelectQuery) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {table}"));
    push_filters(&mut qb, &query.filters, None)?;
    Ok(qb)
}

pub(crate) fn insert_rows(table: &str, rows: Vec<Value>) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let table = quote_ident(table)?;
    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        let Value::Object(fields) = row else {
            return Err(StoreError::invalid_request("inserted rows must be JSON objects"));
        };
        for name in fields.keys() {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }
    if columns.is_empty() {
        return Err(StoreError::invalid_request("inserted rows have no columns"));
    }
    let quoted = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} AS {ROW_ALIAS} ({quoted}) SELECT {quoted} FROM json_populate_recordset(NULL::{table}, "
    ));
    qb.push_bind(Value::Array(rows));
    qb.push(format!("::json) RETURNING row_to_json({ROW_ALIAS})"));
    Ok(qb)
}

pub(crate) fn update_rows(
    table: &str,
    filters: &[Filter],
    patch: Value,
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    if filters.is_empty() {
        return Err(StoreError::invalid_request("refusing to update without a filter"));
    }
    let Value::Object(fields) = &patch else {
        return Err(StoreError::invalid_request("patch must be a JSON object"));
    };
    if fields.is_empty() {
        return Err(StoreError::invalid_request("patch has no columns"));
    }
    let table = quote_ident(table)?;
    let assignments = fields
        .keys()
        .map(|column| quote_ident(column).map(|quoted| format!("{quoted} = p.{quoted}")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let mut qb = QueryBuilder::new(format!(
        "UPDATE {table} AS {ROW_ALIAS} SET {assignments} FROM json_populate_record(NULL::{table}, "
    ));
    qb.push_bind(patch);
    qb.push("::json) AS p");
    push_filters(&mut qb, filters, Some(ROW_ALIAS))?;
    qb.push(format!(" RETURNING row_to_json({ROW_ALIAS})"));
    Ok(qb)
}

pub(crate) fn delete_rows(table: &str, filters: &[Filter]) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    if filters.is_empty() {
        return Err(StoreError::invalid_request("refusing to delete without a filter"));
    }
    let table = quote_ident(table)?;
    let mut qb = QueryBuilder::new(format!("DELETE FROM {table} AS {ROW_ALIAS}"));
    push_filters(&mut qb, filters, Some(ROW_ALIAS))?;
    qb.push(format!(" RETURNING row_to_json({ROW_ALIAS})"));
    Ok(qb)
}
