use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(
    author,
    version,
    about = "Harvests metadata sources into versioned, searchable datasets"
)]
#[command(after_help = "Examples:
  gleaner setup --config gleaner.toml
  gleaner harvest edusources --reset
  gleaner promote edusources --version 0.0.12
  gleaner status edusources --format json")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Elasticsearch base URL
    #[arg(long, env = "ELASTICSEARCH_URL", default_value = "http://localhost:9200")]
    pub elasticsearch_url: String,

    /// Elasticsearch basic auth user
    #[arg(long, env = "ELASTICSEARCH_USER")]
    pub elasticsearch_user: Option<String>,

    /// Elasticsearch basic auth password
    #[arg(long, env = "ELASTICSEARCH_PASSWORD", hide_env_values = true)]
    pub elasticsearch_password: Option<String>,

    /// Base URL of the enrichment resource service
    #[arg(long, env = "RESOURCE_SERVICE_URL", default_value = "http://localhost:8080")]
    pub resource_service_url: String,

    /// Custom path to the gleaner.toml configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register the datasets and sources declared in the configuration file
    Setup,
    /// Run one harvest cycle for a dataset
    #[command(after_help = "Examples:
  gleaner harvest edusources               # Incremental cycle, then publish
  gleaner harvest edusources --reset       # Re-fetch every source from scratch
  gleaner harvest edusources --no-publish  # Promote without pushing to the search engine")]
    Harvest {
        dataset: String,
        /// Reset every harvest of the dataset before fetching
        #[arg(long)]
        reset: bool,
        /// Run enrichment calls concurrently within each batch
        #[arg(long = "async")]
        asynchronous: bool,
        /// Skip pushing the promoted version to the search engine
        #[arg(long)]
        no_publish: bool,
    },
    /// Reset every harvest of a dataset without fetching
    Reset { dataset: String },
    /// Promote the latest version, or make a named version current
    Promote {
        dataset: String,
        /// Version to make current, skipping evaluation
        #[arg(long, value_name = "X.Y.Z")]
        version: Option<String>,
    },
    /// Push the current version of a dataset to the search engine
    Publish {
        dataset: String,
        /// Drop and recreate the remote indices
        #[arg(long)]
        recreate: bool,
    },
    /// Push changed documents of every current index
    Resync {
        /// Seconds between runs; defaults to the configured interval
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Delete old non-current versions of a dataset
    Purge { dataset: String },
    /// Show harvests, versions and indices of a dataset
    Status {
        dataset: String,
        #[arg(short, long, default_value = "text")]
        format: StatusFormat,
    },
}

/// Supported status output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFormat {
    /// Human-readable summary
    Text,
    /// JSON document on stdout
    Json,
}
