//! Current-conditions client for the OpenWeatherMap-style weather API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempcheck_core::{is_plausible_celsius, round1, CityTarget, ReadingSource, WeatherReading};
use tempcheck_storage::{HttpClientConfig, HttpFetcher};
use tracing::info;

use crate::{SourceError, TemperatureSource};

pub const DEFAULT_API_BASE_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ApiClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// The API's view of one city. Only `reading` takes part in reconciliation;
/// the rest is carried into the run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiReading {
    pub reading: WeatherReading,
    pub reported_name: Option<String>,
    pub country: Option<String>,
    pub humidity: Option<f64>,
    pub description: Option<String>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
}

impl ApiReading {
    pub fn min_max_midpoint(&self) -> Option<f64> {
        Some(round1((self.temp_min? + self.temp_max?) / 2.0))
    }
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    name: Option<String>,
    main: MainBlock,
    #[serde(default)]
    sys: Option<SysBlock>,
    #[serde(default)]
    weather: Vec<ConditionBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    feels_like: f64,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SysBlock {
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionBlock {
    description: Option<String>,
}

pub struct ApiClient {
    config: ApiClientConfig,
    http: HttpFetcher,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.config
    }

    fn query(&self, target: &CityTarget) -> Vec<(&'static str, String)> {
        let lookup = match (target.city_id, target.country.as_deref()) {
            (Some(id), _) => ("id", id.to_string()),
            (None, Some(country)) if !country.trim().is_empty() => {
                ("q", format!("{},{}", target.name, country.trim()))
            }
            (None, _) => ("q", target.name.clone()),
        };
        vec![
            lookup,
            ("appid", self.config.api_key.clone()),
            ("units", "metric".to_string()),
        ]
    }

    /// One request for `target`'s current conditions. No retries.
    pub async fn current(&self, target: &CityTarget) -> Result<ApiReading, SourceError> {
        if self.config.api_key.trim().is_empty() {
            return Err(SourceError::Config("weather API key is not configured".into()));
        }

        let response = self
            .http
            .fetch_bytes(&self.config.base_url, &self.query(target))
            .await?;
        let body: CurrentConditions = serde_json::from_slice(&response.body)
            .map_err(|err| SourceError::Malformed(err.to_string()))?;

        let temperature = body.main.temp;
        if !is_plausible_celsius(temperature) {
            return Err(SourceError::Validation { value: temperature });
        }

        let reading = WeatherReading::new(
            target.entity_key(),
            round1(temperature),
            Some(round1(body.main.feels_like)),
            ReadingSource::Api,
        );
        info!(
            city = %target.name,
            temperature = reading.temperature,
            feels_like = body.main.feels_like,
            "api reading"
        );

        Ok(ApiReading {
            reading,
            reported_name: body.name,
            country: body.sys.and_then(|s| s.country),
            humidity: body.main.humidity,
            description: body.weather.into_iter().find_map(|w| w.description),
            temp_min: body.main.temp_min,
            temp_max: body.main.temp_max,
        })
    }
}

#[async_trait]
impl TemperatureSource for ApiClient {
    fn source(&self) -> ReadingSource {
        ReadingSource::Api
    }

    async fn fetch(&mut self, target: &CityTarget) -> Result<WeatherReading, SourceError> {
        self.current(target).await.map(|detail| detail.reading)
    }
}
