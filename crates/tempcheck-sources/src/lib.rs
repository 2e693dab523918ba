//! Temperature sources: the weather API client, the page scraper and the
//! extraction cascade the scraper reads pages with.

use async_trait::async_trait;
use tempcheck_core::{CityTarget, FailureKind, ReadingSource, WeatherReading};
use tempcheck_storage::FetchError;
use thiserror::Error;

pub mod api;
pub mod extract;
pub mod navigator;
pub mod scrape;

pub use api::{ApiClient, ApiClientConfig, ApiReading};
pub use extract::{
    extract_temperature, parse_number, Cascade, ExtractedReading, ExtractionMiss, InvalidSelector,
    ExtractionStrategy, JsonLdStrategy, PageSnapshot, PatternStrategy, ReadingExtractor,
    SelectorStrategy,
};
pub use navigator::{HttpNavigator, NavigationError, Navigator};
pub use scrape::{ScrapeClient, ScrapeConfig, ScrapedReading};

pub const CRATE_NAME: &str = "tempcheck-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network failure: {0}")]
    Network(#[from] FetchError),
    #[error("navigation failed: {0}")]
    Navigation(#[from] NavigationError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no temperature found on {url}")]
    Extraction { url: String },
    #[error("temperature {value}°C is outside the plausible range")]
    Validation { value: f64 },
    #[error("{0}")]
    Config(String),
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) | Self::Navigation(_) => FailureKind::Network,
            Self::Malformed(_) | Self::Extraction { .. } => FailureKind::Extraction,
            Self::Validation { .. } => FailureKind::Validation,
            Self::Config(_) => FailureKind::Configuration,
        }
    }
}

/// One side of the cross-check. Sessions that hold resources (a browser) open
/// them in `start` and release them in `close`; stateless sources keep the
/// defaults.
#[async_trait]
pub trait TemperatureSource: Send {
    fn source(&self) -> ReadingSource;

    async fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn fetch(&mut self, target: &CityTarget) -> Result<WeatherReading, SourceError>;

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
