//! Collection runs: environment configuration, the city registry, the
//! per-city collector and report output.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tempcheck_core::DEFAULT_FEELS_LIKE_MAX_DEVIATION;
use tempcheck_sources::api::DEFAULT_API_BASE_URL;
use tempcheck_sources::scrape::DEFAULT_SITE_BASE_URL;
use tempcheck_sources::{ApiClient, ApiClientConfig, HttpNavigator, ScrapeClient, ScrapeConfig};
use tempcheck_storage::{HttpClientConfig, PageArchive, ReconciliationStore};
use tracing::{info, warn};

mod cities;
mod collector;
pub mod report;

pub use cities::{CityRegistry, FAST_SUBSET_LEN};
pub use collector::{CityOutcome, CollectionRun, Collector, SourceOutcome, DEFAULT_PACING};
pub use report::{ReportEmitter, ReportError, ReportFiles, ReportInput};

pub const CRATE_NAME: &str = "tempcheck-sync";
pub const DEFAULT_THRESHOLD: f64 = 2.0;
pub const RESULTS_FILE_NAME: &str = "collection_results.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub site_base_url: String,
    pub database_url: String,
    pub threshold: f64,
    pub cities_file: PathBuf,
    pub inter_request_delay: Duration,
    pub page_settle: Duration,
    pub api_timeout: Duration,
    pub navigation_timeout: Duration,
    pub feels_like_max_deviation: f64,
    pub reports_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub web_port: u16,
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENWEATHER_API_KEY").unwrap_or_default(),
            api_base_url: std::env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            site_base_url: std::env::var("WEATHER_SITE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SITE_BASE_URL.to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://weather_data.db".to_string()),
            threshold: env_parsed("DISCREPANCY_THRESHOLD").unwrap_or(DEFAULT_THRESHOLD),
            cities_file: std::env::var("CITIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cities.yaml")),
            inter_request_delay: Duration::from_millis(
                env_parsed("INTER_REQUEST_DELAY_MS").unwrap_or(2_000),
            ),
            page_settle: Duration::from_millis(env_parsed("PAGE_SETTLE_MS").unwrap_or(3_000)),
            api_timeout: Duration::from_secs(env_parsed("API_TIMEOUT_SECS").unwrap_or(10)),
            navigation_timeout: Duration::from_secs(
                env_parsed("NAVIGATION_TIMEOUT_SECS").unwrap_or(15),
            ),
            feels_like_max_deviation: env_parsed("FEELS_LIKE_MAX_DEVIATION")
                .unwrap_or(DEFAULT_FEELS_LIKE_MAX_DEVIATION),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("TEMPCHECK_USER_AGENT")
                .unwrap_or_else(|_| "tempcheck/0.1".to_string()),
            web_port: env_parsed("TEMPCHECK_WEB_PORT").unwrap_or(8000),
        }
    }

    pub fn api_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.api_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig {
            base_url: self.site_base_url.clone(),
            navigation_timeout: self.navigation_timeout,
            settle_delay: self.page_settle,
            feels_like_max_deviation: self.feels_like_max_deviation,
        }
    }

    pub fn navigator_http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.navigation_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Per-invocation overrides for a collection run.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    pub cities_file: Option<PathBuf>,
    pub fast: bool,
    pub limit: Option<usize>,
    pub threshold: Option<f64>,
    pub skip_reports: bool,
}

#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub run: CollectionRun,
    pub results_path: PathBuf,
    pub reports: Option<ReportFiles>,
}

pub async fn connect_store(config: &SyncConfig) -> Result<ReconciliationStore> {
    ReconciliationStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))
}

/// One full collection: every selected city through both sources, then the
/// result log and (unless skipped) the report set.
pub async fn run_collection(config: &SyncConfig, options: &CollectOptions) -> Result<CollectOutcome> {
    let cities_file = options
        .cities_file
        .clone()
        .unwrap_or_else(|| config.cities_file.clone());
    let registry = CityRegistry::load_or_builtin(&cities_file)?;
    let targets = registry.select(options.fast, options.limit);
    let threshold = options.threshold.unwrap_or(config.threshold);

    if config.api_key.trim().is_empty() {
        warn!("OPENWEATHER_API_KEY is not set; every api reading will fail");
    }
    info!(cities = targets.len(), threshold, "starting collection");

    let store = connect_store(config).await?;
    let api = ApiClient::new(config.api_config())?;
    let mut scraper = ScrapeClient::new(
        config.scrape_config(),
        Box::new(HttpNavigator::new(config.navigator_http_config())),
    );
    if let Some(dir) = &config.archive_dir {
        scraper = scraper.with_archive(PageArchive::new(dir));
    }

    let mut collector = Collector::new(Box::new(api), Box::new(scraper), store.clone())
        .with_pacing(config.inter_request_delay);
    let run = collector.run(&targets).await?;

    let emitter = ReportEmitter::new(&config.reports_dir);
    let results_path = emitter.run_dir(run.finished_at).join(RESULTS_FILE_NAME);
    run.save_results(&results_path).await?;

    let reports = if options.skip_reports {
        None
    } else {
        let input = ReportInput::from_store(&store, threshold, registry.len(), run.finished_at)
            .await
            .context("loading report data")?;
        Some(emitter.emit(&input).await.context("writing reports")?)
    };

    store.close().await;
    Ok(CollectOutcome {
        run,
        results_path,
        reports,
    })
}

/// Render the report set from whatever the store currently holds.
pub async fn generate_reports(config: &SyncConfig, threshold: Option<f64>) -> Result<ReportFiles> {
    let registry = CityRegistry::load_or_builtin(&config.cities_file)?;
    let store = connect_store(config).await?;
    let input = ReportInput::from_store(
        &store,
        threshold.unwrap_or(config.threshold),
        registry.len(),
        Utc::now(),
    )
    .await
    .context("loading report data")?;
    let files = ReportEmitter::new(&config.reports_dir)
        .emit(&input)
        .await
        .context("writing reports")?;
    store.close().await;
    Ok(files)
}
