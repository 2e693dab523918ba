//! Core domain model for tempcheck: readings, reconciled records and discrepancy math.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tempcheck-core";

/// Physically plausible bounds for any extracted or reported temperature, in °C.
pub const MIN_PLAUSIBLE_CELSIUS: f64 = -50.0;
pub const MAX_PLAUSIBLE_CELSIUS: f64 = 60.0;

/// Default maximum distance between a scraped feels-like value and its temperature.
pub const DEFAULT_FEELS_LIKE_MAX_DEVIATION: f64 = 15.0;

pub fn is_plausible_celsius(value: f64) -> bool {
    value.is_finite() && (MIN_PLAUSIBLE_CELSIUS..=MAX_PLAUSIBLE_CELSIUS).contains(&value)
}

/// Round to one decimal place, the precision both sources are compared at.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn discrepancy(a: f64, b: f64) -> f64 {
    (a - b).abs()
}

/// Strict greater-than: a difference equal to the threshold is not flagged.
pub fn exceeds_threshold(difference: f64, threshold: f64) -> bool {
    difference > threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingSource {
    Api,
    Scraped,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Api => "API",
            ReadingSource::Scraped => "SCRAPED",
        }
    }
}

/// Why a source produced no reading for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection error, non-2xx status or a failed page load.
    Network,
    /// Nothing usable could be read out of the response or page.
    Extraction,
    /// A well-formed number outside the plausible range.
    Validation,
    Persistence,
    /// The entity cannot be addressed on this source (e.g. no page locator).
    Configuration,
}

/// A single source's measurement for one entity at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub entity_key: String,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub source: ReadingSource,
    pub captured_at: DateTime<Utc>,
}

impl WeatherReading {
    pub fn new(
        entity_key: impl Into<String>,
        temperature: f64,
        feels_like: Option<f64>,
        source: ReadingSource,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            temperature,
            feels_like,
            source,
            captured_at: Utc::now(),
        }
    }
}

/// The numeric inputs of one store write, merged from whichever sources succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub entity_key: String,
    pub temperature_scraped: Option<f64>,
    pub feels_like_scraped: Option<f64>,
    pub temperature_api: Option<f64>,
    pub feels_like_api: Option<f64>,
}

impl RecordUpdate {
    pub fn empty(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            temperature_scraped: None,
            feels_like_scraped: None,
            temperature_api: None,
            feels_like_api: None,
        }
    }

    /// Merge the two sources' readings. Neither side is preferred; a missing side
    /// leaves its columns null.
    pub fn merge(
        entity_key: impl Into<String>,
        api: Option<&WeatherReading>,
        scraped: Option<&WeatherReading>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            temperature_scraped: scraped.map(|r| r.temperature),
            feels_like_scraped: scraped.and_then(|r| r.feels_like),
            temperature_api: api.map(|r| r.temperature),
            feels_like_api: api.and_then(|r| r.feels_like),
        }
    }

    pub fn average_temperature(&self) -> Option<f64> {
        match (self.temperature_scraped, self.temperature_api) {
            (Some(scraped), Some(api)) => Some((scraped + api) / 2.0),
            _ => None,
        }
    }

    pub fn into_record(self, updated_at: DateTime<Utc>) -> ReconciledRecord {
        let average_temperature = self.average_temperature();
        ReconciledRecord {
            entity_key: self.entity_key,
            temperature_scraped: self.temperature_scraped,
            feels_like_scraped: self.feels_like_scraped,
            temperature_api: self.temperature_api,
            feels_like_api: self.feels_like_api,
            average_temperature,
            updated_at,
        }
    }
}

/// Persisted per-entity row combining both sources' last-known readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRecord {
    pub entity_key: String,
    pub temperature_scraped: Option<f64>,
    pub feels_like_scraped: Option<f64>,
    pub temperature_api: Option<f64>,
    pub feels_like_api: Option<f64>,
    pub average_temperature: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciledRecord {
    pub fn has_both_sources(&self) -> bool {
        self.temperature_scraped.is_some() && self.temperature_api.is_some()
    }

    pub fn discrepancy(&self) -> Option<f64> {
        match (self.temperature_scraped, self.temperature_api) {
            (Some(scraped), Some(api)) => Some(discrepancy(scraped, api)),
            _ => None,
        }
    }

    pub fn discrepancy_entry(&self) -> Option<DiscrepancyEntry> {
        let (scraped, api) = (self.temperature_scraped?, self.temperature_api?);
        Some(DiscrepancyEntry {
            entity_key: self.entity_key.clone(),
            temperature_scraped: scraped,
            temperature_api: api,
            absolute_difference: discrepancy(scraped, api),
        })
    }
}

/// Derived on read; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyEntry {
    pub entity_key: String,
    pub temperature_scraped: f64,
    pub temperature_api: f64,
    pub absolute_difference: f64,
}

/// Keep entries strictly above `threshold`, largest difference first.
pub fn filter_discrepancies(
    records: &[ReconciledRecord],
    threshold: f64,
) -> Vec<DiscrepancyEntry> {
    let mut entries = records
        .iter()
        .filter_map(ReconciledRecord::discrepancy_entry)
        .filter(|e| exceeds_threshold(e.absolute_difference, threshold))
        .collect::<Vec<_>>();
    sort_discrepancies(&mut entries);
    entries
}

pub fn sort_discrepancies(entries: &mut [DiscrepancyEntry]) {
    entries.sort_by(|a, b| {
        b.absolute_difference
            .total_cmp(&a.absolute_difference)
            .then_with(|| a.entity_key.cmp(&b.entity_key))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DiscrepancyStats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    pub count: usize,
}

impl DiscrepancyStats {
    /// Zeroed stats for an empty input.
    pub fn from_differences(differences: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for d in differences {
            count += 1;
            sum += d;
            max = max.max(d);
            min = min.min(d);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            mean: sum / count as f64,
            max,
            min,
            count,
        }
    }

    pub fn from_records(records: &[ReconciledRecord]) -> Self {
        Self::from_differences(records.iter().filter_map(ReconciledRecord::discrepancy))
    }
}

/// One entity to collect: its key plus how to reach it on each source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityTarget {
    pub name: String,
    /// Site path below the weather base URL, e.g. `uk/london`.
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Numeric API id; queried instead of the name when present.
    #[serde(default)]
    pub city_id: Option<u64>,
}

impl CityTarget {
    pub fn new(name: impl Into<String>, page: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page: Some(page.into()),
            country: None,
            city_id: None,
        }
    }

    pub fn entity_key(&self) -> &str {
        &self.name
    }

    /// Explicit page path, or `country-slug/city-slug` when only a country is known.
    pub fn page_locator(&self) -> Option<String> {
        if let Some(page) = &self.page {
            let page = page.trim().trim_matches('/');
            if !page.is_empty() {
                return Some(page.to_string());
            }
        }
        let country = self.country.as_deref().map(slugify)?;
        let city = slugify(&self.name);
        if country.is_empty() || city.is_empty() {
            return None;
        }
        Some(format!("{country}/{city}"))
    }
}

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CollectionSummary {
    pub total: usize,
    pub api_ok: usize,
    pub scrape_ok: usize,
    pub both: usize,
    pub neither: usize,
    pub persisted: usize,
}

impl CollectionSummary {
    pub fn record(&mut self, api_ok: bool, scrape_ok: bool, persisted: bool) {
        self.total += 1;
        if api_ok {
            self.api_ok += 1;
        }
        if scrape_ok {
            self.scrape_ok += 1;
        }
        match (api_ok, scrape_ok) {
            (true, true) => self.both += 1,
            (false, false) => self.neither += 1,
            _ => {}
        }
        if persisted {
            self.persisted += 1;
        }
    }
}
