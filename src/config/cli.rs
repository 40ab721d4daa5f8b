use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the JourneyHub admin binary.
#[derive(Debug, Parser)]
#[command(
    name = "journeyhub",
    version,
    about = "JourneyHub resource query and cache tool"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "JOURNEYHUB_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List the known resources and their primary keys.
    Resources,
    /// List rows of a resource, optionally filtered and paginated.
    List(ListArgs),
    /// Fetch one row by primary key.
    Get(GetArgs),
    /// Insert one row from a JSON object.
    Create(CreateArgs),
    /// Delete one row by primary key.
    Remove(GetArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Resource name, e.g. `missions`.
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    /// Equality filter `column=value`; repeatable.
    #[arg(long = "where", value_name = "COLUMN=VALUE")]
    pub conditions: Vec<String>,

    /// Rows per page; without it the whole list is fetched at once.
    #[arg(long = "page-size", value_name = "COUNT")]
    pub page_size: Option<u64>,

    /// Pages to load when paginating.
    #[arg(long, default_value_t = 1, value_name = "COUNT")]
    pub pages: usize,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Debug, Args, Clone)]
pub struct CreateArgs {
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    /// Row to insert as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub json: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT", global = true)]
    pub database_max_connections: Option<u32>,

    /// Override the cache retry count.
    #[arg(long = "cache-error-retry-count", value_name = "COUNT", global = true)]
    pub cache_error_retry_count: Option<u32>,
}
