use std::{process, sync::Arc};

use clap::Parser;
use journeyhub::{
    application::{
        catalog,
        context::QueryClient,
        error::AppError,
        hooks::{self, TableResource},
    },
    cache::{CacheConfig, KeyParams, Primitive},
    config::{self, CliArgs, Command, CreateArgs, GetArgs, ListArgs},
    infra::{db::PostgresStore, error::InfraError, telemetry},
};
use serde::Serialize;
use serde_json::Value;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let cli_args = CliArgs::parse();
    let settings = config::load(&cli_args)
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    if let Command::Resources = cli_args.command {
        return print_json(&resource_listing());
    }

    let client = init_client(&settings).await?;
    let result = match cli_args.command {
        Command::Resources => Ok(()),
        Command::List(args) => run_list(&client, args).await,
        Command::Get(args) => run_get(&client, args).await,
        Command::Create(args) => run_create(&client, args).await,
        Command::Remove(args) => run_remove(&client, args).await,
    };
    client.teardown();
    result
}

async fn init_client(settings: &config::Settings) -> Result<QueryClient, AppError> {
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or(InfraError::MissingDatabaseUrl)?;
    let pool = PostgresStore::connect(url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    let store = PostgresStore::new(pool);
    store
        .health_check()
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    info!(
        max_connections = settings.database.max_connections.get(),
        "Database connection established"
    );

    Ok(QueryClient::new(
        CacheConfig::from(&settings.cache),
        Arc::new(store),
    ))
}

fn resource_listing() -> Vec<Value> {
    catalog::all()
        .into_iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "primary_key": spec.primary_key,
                "projection": spec.projection,
            })
        })
        .collect()
}

fn resource(client: &QueryClient, name: &str) -> Result<TableResource, AppError> {
    catalog::lookup(name)
        .map(|spec| hooks::table(client, spec))
        .ok_or_else(|| AppError::validation(format!("unknown resource `{name}`")))
}

async fn run_list(client: &QueryClient, args: ListArgs) -> Result<(), AppError> {
    let resource = resource(client, &args.resource)?;
    let conditions = args
        .conditions
        .iter()
        .map(|raw| parse_condition(raw))
        .collect::<Result<KeyParams, AppError>>()?;

    let Some(page_size) = args.page_size else {
        let mut handle = if conditions.is_empty() {
            resource.list()
        } else {
            resource.list_where(conditions)
        };
        let state = handle.settled().await;
        if let Some(error) = state.error {
            return Err(error.into());
        }
        let rows = state.data.map(|rows| rows.as_ref().clone()).unwrap_or_default();
        return print_json(&rows);
    };

    let query = resource.list_paginated(conditions, page_size);
    query.settled().await;
    while query.requested_pages() < args.pages && query.load_more() {
        query.settled().await;
    }
    if let Some(error) = query.error() {
        return Err(error.into());
    }
    print_json(&serde_json::json!({
        "rows": query.data(),
        "total": query.total(),
        "has_next_page": query.has_next_page(),
    }))
}

async fn run_get(client: &QueryClient, args: GetArgs) -> Result<(), AppError> {
    let resource = resource(client, &args.resource)?;
    match resource.get_by_id(parse_value(&args.id)).await? {
        Some(row) => print_json(&row),
        None => Err(AppError::NotFound),
    }
}

async fn run_create(client: &QueryClient, args: CreateArgs) -> Result<(), AppError> {
    let resource = resource(client, &args.resource)?;
    let row: Value = serde_json::from_str(&args.json)
        .map_err(|err| AppError::validation(format!("invalid JSON row: {err}")))?;
    if !row.is_object() {
        return Err(AppError::validation("row must be a JSON object"));
    }
    let created = resource.create(row).await?;
    print_json(&created)
}

async fn run_remove(client: &QueryClient, args: GetArgs) -> Result<(), AppError> {
    let resource = resource(client, &args.resource)?;
    resource.remove(parse_value(&args.id)).await?;
    info!(resource = %args.resource, id = %args.id, "Row removed");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}

fn parse_condition(raw: &str) -> Result<(String, Primitive), AppError> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| AppError::validation(format!("expected COLUMN=VALUE, got `{raw}`")))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(AppError::validation(format!("missing column in `{raw}`")));
    }
    Ok((column.to_string(), parse_value(value)))
}

/// Integers, booleans and `null` keep their type; anything else is text.
fn parse_value(raw: &str) -> Primitive {
    let raw = raw.trim();
    if raw == "null" {
        return Primitive::Null;
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Primitive::Int(value);
    }
    if let Ok(value) = raw.parse::<bool>() {
        return Primitive::Bool(value);
    }
    Primitive::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_parse_typed_values() {
        assert_eq!(
            parse_condition("week_id=3").expect("valid"),
            ("week_id".to_string(), Primitive::Int(3))
        );
        assert_eq!(
            parse_condition("status = open").expect("valid"),
            ("status".to_string(), Primitive::Text("open".into()))
        );
        assert_eq!(parse_value("null"), Primitive::Null);
        assert_eq!(parse_value("true"), Primitive::Bool(true));
        assert!(parse_condition("status").is_err());
        assert!(parse_condition("=open").is_err());
    }
}
