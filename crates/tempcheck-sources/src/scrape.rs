//! Website scraper: drives a [`Navigator`] session and reads each page with the
//! extraction cascade.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tempcheck_core::{CityTarget, ReadingSource, WeatherReading, DEFAULT_FEELS_LIKE_MAX_DEVIATION};
use tempcheck_storage::PageArchive;
use tracing::{debug, info, warn};

use crate::extract::{ExtractionMiss, ReadingExtractor};
use crate::navigator::{NavigationError, Navigator};
use crate::{SourceError, TemperatureSource};

pub const DEFAULT_SITE_BASE_URL: &str = "https://www.timeanddate.com/weather";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub navigation_timeout: Duration,
    /// Pause after load so client-side rendering can finish.
    pub settle_delay: Duration,
    pub feels_like_max_deviation: f64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SITE_BASE_URL.to_string(),
            navigation_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_secs(3),
            feels_like_max_deviation: DEFAULT_FEELS_LIKE_MAX_DEVIATION,
        }
    }
}

impl ScrapeConfig {
    pub fn page_url(&self, page_locator: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            page_locator.trim_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapedReading {
    pub reading: WeatherReading,
    pub url: String,
    pub temperature_strategy: &'static str,
    pub feels_like_strategy: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Idle,
    Open,
    Closed,
}

pub struct ScrapeClient {
    config: ScrapeConfig,
    navigator: Box<dyn Navigator>,
    extractor: ReadingExtractor,
    archive: Option<PageArchive>,
    session: Session,
}

impl ScrapeClient {
    pub fn new(config: ScrapeConfig, navigator: Box<dyn Navigator>) -> Self {
        let extractor = ReadingExtractor::new(config.feels_like_max_deviation);
        Self {
            config,
            navigator,
            extractor,
            archive: None,
            session: Session::Idle,
        }
    }

    /// Keep a copy of every loaded page under `archive`.
    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn is_open(&self) -> bool {
        self.session == Session::Open
    }

    pub async fn start(&mut self) -> Result<(), SourceError> {
        match self.session {
            Session::Open => Ok(()),
            Session::Closed => Err(NavigationError::Startup("session already closed".into()).into()),
            Session::Idle => {
                self.navigator.start().await?;
                self.session = Session::Open;
                info!(base_url = %self.config.base_url, "scrape session started");
                Ok(())
            }
        }
    }

    pub async fn scrape(
        &mut self,
        entity_key: &str,
        page_locator: &str,
    ) -> Result<ScrapedReading, SourceError> {
        if self.session != Session::Open {
            return Err(NavigationError::NotStarted.into());
        }

        let url = self.config.page_url(page_locator);
        self.navigator
            .open(&url, self.config.navigation_timeout)
            .await?;
        self.navigator.wait(self.config.settle_delay).await;
        if let Ok(Some(heading)) = self.navigator.query_text("h1").await {
            debug!(%url, heading = %heading, "page settled");
        }
        let html = self.navigator.content().await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store_page(chrono::Utc::now(), entity_key, &html).await {
                warn!(error = %format!("{err:#}"), city = entity_key, "page archive write failed");
            }
        }

        let extracted = self.extractor.extract(&html).map_err(|miss| match miss {
            ExtractionMiss::NotFound => SourceError::Extraction { url: url.clone() },
            ExtractionMiss::Implausible { value } => SourceError::Validation { value },
        })?;

        info!(
            city = entity_key,
            temperature = extracted.temperature,
            feels_like = extracted.feels_like,
            strategy = extracted.temperature_strategy,
            "scraped reading"
        );

        Ok(ScrapedReading {
            reading: WeatherReading::new(
                entity_key,
                extracted.temperature,
                Some(extracted.feels_like),
                ReadingSource::Scraped,
            ),
            url,
            temperature_strategy: extracted.temperature_strategy,
            feels_like_strategy: extracted.feels_like_strategy,
        })
    }

    /// Release the navigator session. Safe to call more than once; only the
    /// first call after a successful start reaches the navigator.
    pub async fn close(&mut self) -> Result<(), SourceError> {
        if self.session != Session::Open {
            self.session = Session::Closed;
            return Ok(());
        }
        self.session = Session::Closed;
        self.navigator.close().await?;
        info!("scrape session closed");
        Ok(())
    }
}

#[async_trait]
impl TemperatureSource for ScrapeClient {
    fn source(&self) -> ReadingSource {
        ReadingSource::Scraped
    }

    async fn start(&mut self) -> Result<(), SourceError> {
        ScrapeClient::start(self).await
    }

    async fn fetch(&mut self, target: &CityTarget) -> Result<WeatherReading, SourceError> {
        let locator = target.page_locator().ok_or_else(|| {
            SourceError::Config(format!("{} has no page locator", target.name))
        })?;
        self.scrape(target.entity_key(), &locator)
            .await
            .map(|scraped| scraped.reading)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        ScrapeClient::close(self).await
    }
}
