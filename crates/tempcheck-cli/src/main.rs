use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tempcheck_sync::{connect_store, generate_reports, run_collection, CollectOptions, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tempcheck")]
#[command(about = "Cross-check weather API temperatures against a weather website")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect both sources for every configured city, then write reports.
    Collect {
        /// YAML city registry (defaults to CITIES_FILE or cities.yaml).
        #[arg(long)]
        cities: Option<PathBuf>,
        /// Only the first three cities.
        #[arg(long)]
        fast: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        no_report: bool,
    },
    /// Regenerate reports from the stored records.
    Report {
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Print discrepancy statistics.
    Stats,
    /// Serve the dashboard.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete every stored record.
    Clear,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Collect {
            cities: None,
            fast: false,
            limit: None,
            threshold: None,
            no_report: false,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or_default() {
        Commands::Collect {
            cities,
            fast,
            limit,
            threshold,
            no_report,
        } => {
            let options = CollectOptions {
                cities_file: cities,
                fast,
                limit,
                threshold,
                skip_reports: no_report,
            };
            let outcome = run_collection(&config, &options).await?;
            let summary = outcome.run.summary;
            println!(
                "collection complete: run_id={} cities={} api_ok={} scrape_ok={} both={} persisted={}",
                outcome.run.run_id,
                summary.total,
                summary.api_ok,
                summary.scrape_ok,
                summary.both,
                summary.persisted
            );
            println!("results: {}", outcome.results_path.display());
            if let Some(reports) = outcome.reports {
                println!("reports: {}", reports.dir.display());
            }
        }
        Commands::Report { threshold } => {
            let files = generate_reports(&config, threshold).await?;
            println!("reports: {}", files.dir.display());
        }
        Commands::Stats => {
            let store = connect_store(&config).await?;
            let stats = store.statistics().await?;
            let flagged = store.discrepancies(config.threshold).await?;
            store.close().await;
            println!("cities compared: {}", stats.count);
            println!("mean discrepancy: {:.2} C", stats.mean);
            println!("max discrepancy: {:.2} C", stats.max);
            println!("min discrepancy: {:.2} C", stats.min);
            println!("above {} C: {}", config.threshold, flagged.len());
            for entry in flagged {
                println!(
                    "  {}: web={:.1} api={:.1} diff={:.2}",
                    entry.entity_key,
                    entry.temperature_scraped,
                    entry.temperature_api,
                    entry.absolute_difference
                );
            }
        }
        Commands::Serve { port: None } => tempcheck_web::serve_from_env().await?,
        Commands::Serve { port: Some(port) } => {
            let store = connect_store(&config).await?;
            tempcheck_web::serve(tempcheck_web::AppState::new(store, config.threshold), port).await?;
        }
        Commands::Clear => {
            let store = connect_store(&config).await?;
            let removed = store.clear().await?;
            store.close().await;
            println!("cleared {removed} records");
        }
    }

    Ok(())
}
