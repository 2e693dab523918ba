use std::path::{Path, PathBuf};
use std::time::Duration;

use tempcheck_core::{FailureKind, DEFAULT_FEELS_LIKE_MAX_DEVIATION};
use tempcheck_sync::{
    connect_store, run_collection, CollectOptions, CollectionRun, SyncConfig, RESULTS_FILE_NAME,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(relative: &str) -> String {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    std::fs::read_to_string(root.join(relative)).expect("fixture readable")
}

fn api_body(name: &str, temp: f64, feels_like: f64) -> String {
    serde_json::json!({
        "name": name,
        "main": {"temp": temp, "feels_like": feels_like, "humidity": 60},
        "weather": [{"description": "clear sky"}],
    })
    .to_string()
}

async fn upstreams() -> (MockServer, MockServer) {
    let api = MockServer::start().await;
    for (city, temp, feels) in [("New York", 18.0, 17.2), ("London", 9.5, 8.0), ("Tokyo", 24.0, 25.5)] {
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .and(query_param("q", city))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_string(api_body(city, temp, feels)))
            .mount(&api)
            .await;
    }

    let site = MockServer::start().await;
    for (page, file) in [
        ("/weather/uk/london", "timeanddate/uk-london.html"),
        ("/weather/japan/tokyo", "timeanddate/japan-tokyo.html"),
    ] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture(file)))
            .mount(&site)
            .await;
    }
    (api, site)
}

fn config(dir: &Path, api: &MockServer, site: &MockServer) -> SyncConfig {
    SyncConfig {
        api_key: "pipeline-key".into(),
        api_base_url: format!("{}/data/2.5/weather", api.uri()),
        site_base_url: format!("{}/weather", site.uri()),
        database_url: format!("sqlite://{}", dir.join("weather_data.db").display()),
        threshold: 2.0,
        cities_file: dir.join("missing-cities.yaml"),
        inter_request_delay: Duration::ZERO,
        page_settle: Duration::ZERO,
        api_timeout: Duration::from_secs(5),
        navigation_timeout: Duration::from_secs(5),
        feels_like_max_deviation: DEFAULT_FEELS_LIKE_MAX_DEVIATION,
        reports_dir: dir.join("reports"),
        archive_dir: Some(dir.join("pages")),
        user_agent: "tempcheck-test".into(),
        web_port: 0,
    }
}

#[tokio::test]
async fn fast_run_collects_persists_and_reports() {
    let (api, site) = upstreams().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &api, &site);

    let outcome = run_collection(
        &config,
        &CollectOptions {
            fast: true,
            ..CollectOptions::default()
        },
    )
    .await
    .unwrap();

    let summary = outcome.run.summary;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.api_ok, 3);
    assert_eq!(summary.scrape_ok, 2);
    assert_eq!(summary.both, 2);
    assert_eq!(summary.persisted, 3);

    let new_york = &outcome.run.outcomes[0];
    assert_eq!(new_york.city, "New York");
    assert_eq!(new_york.scraped.failure, Some(FailureKind::Network));
    assert_eq!(
        new_york.record.as_ref().and_then(|r| r.temperature_api),
        Some(18.0)
    );

    // London: site 12.0 vs api 9.5.
    let store = connect_store(&config).await.unwrap();
    let flagged = store.discrepancies(2.0).await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].entity_key, "London");
    assert!((flagged[0].absolute_difference - 2.5).abs() < 1e-9);
    store.close().await;

    let reports = outcome.reports.expect("reports written");
    assert_eq!(outcome.results_path.parent(), Some(reports.dir.as_path()));
    assert!(outcome.results_path.ends_with(RESULTS_FILE_NAME));
    let saved: CollectionRun =
        serde_json::from_str(&std::fs::read_to_string(&outcome.results_path).unwrap()).unwrap();
    assert_eq!(saved.run_id, outcome.run.run_id);

    let analysis: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&reports.analysis_json).unwrap()).unwrap();
    assert_eq!(analysis["metadata"]["cities_above_threshold"], 1);
    assert_eq!(analysis["cities_with_discrepancies"][0]["city"], "London");

    let stats = std::fs::read_to_string(&reports.statistics_csv).unwrap();
    assert!(stats.contains("Success Rate,10.0,percent"));

    assert!(dir.path().join("pages").exists());
}

#[tokio::test]
async fn repeated_runs_replace_records_instead_of_duplicating() {
    let (api, site) = upstreams().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &api, &site);
    let options = CollectOptions {
        fast: true,
        limit: Some(2),
        skip_reports: true,
        ..CollectOptions::default()
    };

    let first = run_collection(&config, &options).await.unwrap();
    assert!(first.reports.is_none());
    run_collection(&config, &options).await.unwrap();

    let store = connect_store(&config).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    store.close().await;
}
