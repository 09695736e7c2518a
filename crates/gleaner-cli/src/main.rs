use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gleaner_cli::{Command, Config, StatusFormat};
use gleaner_client::{CkanClient, ElasticClient, ResourceServiceClient};
use gleaner_core::{
    load_config, Collaborators, ConnectorRegistry, CycleOptions, CycleSummary, DatasetStatus,
    GleanerConfig, HarvestService, HttpConfig, TracingNotifier,
};
use gleaner_db::PgRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for status output)
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if config.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let mut settings = load_config(config.config.as_deref()).context("Failed to load configuration")?;
    if let Command::Harvest {
        asynchronous: true, ..
    } = config.command
    {
        settings.enrichment.asynchronous = true;
    }

    // Database connection
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let repo = PgRepository::new(pool);
    repo.migrate().await.context("Failed to apply migrations")?;

    // Initialize services
    let service = HarvestService::new(repo, collaborators(&config, &settings)?, &settings);
    let cancel = cancel_on_ctrl_c();

    // Execute command
    match config.command {
        Command::Setup => {
            let registered = service.setup(&settings).await?;
            for (dataset, harvests) in registered {
                info!(dataset = %dataset.name, sources = harvests.len(), "Dataset registered");
            }
        }
        Command::Harvest {
            dataset,
            reset,
            no_publish,
            ..
        } => {
            let options = CycleOptions {
                reset,
                publish: !no_publish,
                ..Default::default()
            };
            let summary = service
                .run_cycle(&dataset, options, &cancel)
                .await
                .with_context(|| format!("Harvest of {} failed", dataset))?;
            print_summary(&summary);
        }
        Command::Reset { dataset } => {
            let cycle = service.reset(&dataset).await?;
            println!(
                "Reset {} harvests of {} (version {})",
                cycle.harvests.len(),
                cycle.dataset.name,
                cycle.version.version
            );
        }
        Command::Promote { dataset, version } => {
            let promotion = service.promote(&dataset, version.as_deref()).await?;
            println!("Current version of {}: {}", dataset, promotion.version.version);
            if !promotion.fallbacks.is_empty() {
                println!("Restored from previous version: {}", promotion.fallbacks.join(", "));
            }
        }
        Command::Publish { dataset, recreate } => {
            let indices = service.publish(&dataset, recreate).await?;
            for index in indices {
                println!(
                    "{} ({}): {} errors",
                    index.remote_name, index.language, index.error_count
                );
            }
        }
        Command::Resync { interval, once } => {
            if once {
                let report = service.resync().await?;
                println!(
                    "Resync: {} synced, {} skipped, {} failed",
                    report.synced, report.skipped, report.failed
                );
            } else {
                let interval = interval
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| settings.index.resync_interval());
                info!(interval_secs = interval.as_secs(), "Starting resync loop");
                service.resync_loop(interval, &cancel).await?;
            }
        }
        Command::Purge { dataset } => {
            let purged = service.purge(&dataset).await?;
            if purged.is_empty() {
                println!("Nothing to purge for {}", dataset);
            } else {
                println!("Purged versions of {}: {}", dataset, purged.join(", "));
            }
        }
        Command::Status { dataset, format } => {
            let status = service.status(&dataset).await?;
            match format {
                StatusFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                StatusFormat::Text => print_status(&dataset, &status),
            }
        }
    }

    Ok(())
}

/// Builds the remote collaborators from CLI settings and the source list.
fn collaborators(config: &Config, settings: &GleanerConfig) -> anyhow::Result<Collaborators> {
    let http = HttpConfig::default();

    let mut connectors = ConnectorRegistry::new();
    for source in &settings.sources {
        match source.connector.as_str() {
            "ckan" => {
                let client = CkanClient::new(&source.endpoint, http.clone())
                    .with_context(|| format!("Invalid endpoint for source {}", source.name))?;
                connectors.register(source.name.clone(), Arc::new(client));
            }
            other => warn!(
                source = %source.name,
                connector = other,
                "Unsupported connector type, source will fail to harvest"
            ),
        }
    }

    let mut engine = ElasticClient::new(&config.elasticsearch_url, http.clone())
        .context("Invalid Elasticsearch URL")?;
    if let (Some(user), Some(password)) =
        (&config.elasticsearch_user, &config.elasticsearch_password)
    {
        engine = engine.with_credentials(user, password);
    }
    let fetcher = ResourceServiceClient::new(&config.resource_service_url, http)
        .context("Invalid resource service URL")?;

    Ok(Collaborators {
        connectors,
        fetcher: Arc::new(fetcher),
        engine: Arc::new(engine),
        notifier: Arc::new(TracingNotifier),
    })
}

/// Cancels the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing current work");
            child.cancel();
        }
    });
    token
}

fn print_summary(summary: &CycleSummary) {
    println!("\nHarvest of {}", summary.dataset);
    if let Some(version) = &summary.version {
        println!("  Version:     {}", version);
    }
    for result in &summary.results {
        match &result.error {
            None => println!(
                "  {:<20} {:<10} created {} updated {} deleted {} unchanged {} failed {}",
                result.source_name,
                result.stage.as_str(),
                result.stats.created,
                result.stats.updated,
                result.stats.deleted,
                result.stats.unchanged,
                result.stats.failed
            ),
            Some(error) => println!(
                "  {:<20} {:<10} FAILED: {}",
                result.source_name, result.stage.as_str(), error
            ),
        }
    }
    if !summary.fallback_collections.is_empty() {
        println!(
            "  Restored:    {}",
            summary.fallback_collections.join(", ")
        );
    }
    println!("  Promoted:    {}", summary.promoted);
    println!("  Published:   {} indices\n", summary.published_indices);
}

fn print_status(name: &str, status: &DatasetStatus) {
    let Some(dataset) = &status.dataset else {
        println!("Dataset {} is not registered", name);
        return;
    };

    println!("\nDataset {} ({})", dataset.name, dataset.id);
    println!("\n  Harvests:");
    for sh in &status.harvests {
        let harvested = sh
            .harvest
            .harvested_at
            .map(|at| at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "    {:<20} {:<10} harvested {}{}",
            sh.source.name,
            sh.harvest.stage.as_str(),
            harvested,
            if sh.harvest.is_syncing { " (syncing)" } else { "" }
        );
    }
    println!("\n  Versions:");
    for version in &status.versions {
        println!(
            "    {:<10} {}{}",
            version.version,
            version.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
            if version.is_current { "  current" } else { "" }
        );
    }
    println!("\n  Indices:");
    for index in &status.indices {
        let pushed = index
            .pushed_at
            .map(|at| at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "    {:<30} pushed {} errors {}",
            index.remote_name, pushed, index.error_count
        );
    }
    println!();
}
