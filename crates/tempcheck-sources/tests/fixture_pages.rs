use std::path::PathBuf;
use std::time::Duration;

use tempcheck_core::{CityTarget, FailureKind, ReadingSource};
use tempcheck_sources::{
    ApiClient, ApiClientConfig, HttpNavigator, ReadingExtractor, ScrapeClient, ScrapeConfig,
    TemperatureSource,
};
use tempcheck_storage::HttpClientConfig;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(relative: &str) -> String {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    std::fs::read_to_string(root.join(relative)).expect("fixture readable")
}

async fn site() -> MockServer {
    let server = MockServer::start().await;
    for (page, file) in [
        ("/weather/uk/london", "timeanddate/uk-london.html"),
        ("/weather/japan/tokyo", "timeanddate/japan-tokyo.html"),
        ("/weather/australia/sydney", "timeanddate/australia-sydney.html"),
        ("/weather/nowhere/atlantis", "timeanddate/no-reading.html"),
    ] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(fixture(file)),
            )
            .mount(&server)
            .await;
    }
    server
}

fn scrape_client(server: &MockServer) -> ScrapeClient {
    let config = ScrapeConfig {
        base_url: format!("{}/weather", server.uri()),
        navigation_timeout: Duration::from_secs(5),
        settle_delay: Duration::ZERO,
        ..ScrapeConfig::default()
    };
    ScrapeClient::new(config, Box::new(HttpNavigator::new(HttpClientConfig::default())))
}

#[test]
fn each_fixture_is_read_by_the_expected_strategy() {
    let extractor = ReadingExtractor::default();

    let london = extractor.extract(&fixture("timeanddate/uk-london.html")).unwrap();
    assert_eq!((london.temperature, london.feels_like), (12.0, 10.0));
    assert_eq!(london.temperature_strategy, "selector");

    let tokyo = extractor.extract(&fixture("timeanddate/japan-tokyo.html")).unwrap();
    assert_eq!((tokyo.temperature, tokyo.feels_like), (24.6, 26.1));

    let sydney = extractor
        .extract(&fixture("timeanddate/australia-sydney.html"))
        .unwrap();
    assert_eq!((sydney.temperature, sydney.feels_like), (18.2, 16.8));
    assert_eq!(sydney.temperature_strategy, "json-ld");

    assert!(extractor
        .extract(&fixture("timeanddate/no-reading.html"))
        .is_err());
}

#[tokio::test]
async fn scrapes_served_pages_over_http() {
    let server = site().await;
    let mut client = scrape_client(&server);
    client.start().await.unwrap();

    let london = client
        .fetch(&CityTarget::new("London", "uk/london"))
        .await
        .unwrap();
    assert_eq!(london.source, ReadingSource::Scraped);
    assert_eq!(london.temperature, 12.0);

    let mut tokyo = CityTarget::new("Tokyo", "");
    tokyo.page = None;
    tokyo.country = Some("Japan".into());
    let tokyo = client.fetch(&tokyo).await.unwrap();
    assert_eq!(tokyo.feels_like, Some(26.1));

    let missing = client
        .fetch(&CityTarget::new("Atlantis", "nowhere/atlantis"))
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), FailureKind::Extraction);

    let unknown = client
        .fetch(&CityTarget::new("Paris", "france/paris"))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), FailureKind::Network);

    client.close().await.unwrap();
    assert!(!client.is_open());
}

#[tokio::test]
async fn api_fixture_maps_to_a_reading() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .and(query_param("q", "London,GB"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("openweather/london.json")))
        .mount(&server)
        .await;

    let mut config = ApiClientConfig::new("test-key");
    config.base_url = format!("{}/data/2.5/weather", server.uri());
    let mut api = ApiClient::new(config).unwrap();

    let mut target = CityTarget::new("London", "uk/london");
    target.country = Some("GB".into());
    let detail = api.current(&target).await.unwrap();
    assert_eq!(detail.reading.temperature, 13.1);
    assert_eq!(detail.reading.feels_like, Some(12.4));
    assert_eq!(detail.min_max_midpoint(), Some(13.1));

    let reading = api.fetch(&target).await.unwrap();
    assert_eq!(reading.source, ReadingSource::Api);
}
