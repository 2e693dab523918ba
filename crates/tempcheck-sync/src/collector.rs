use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tempcheck_core::{
    CityTarget, CollectionSummary, FailureKind, ReconciledRecord, RecordUpdate, WeatherReading,
};
use tempcheck_sources::{SourceError, TemperatureSource};
use tempcheck_storage::ReconciliationStore;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_PACING: Duration = Duration::from_secs(2);

/// What one source produced for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub reading: Option<WeatherReading>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn from_result(result: Result<WeatherReading, SourceError>) -> Self {
        match result {
            Ok(reading) => Self {
                reading: Some(reading),
                failure: None,
                error: None,
            },
            Err(err) => Self {
                reading: None,
                failure: Some(err.kind()),
                error: Some(err.to_string()),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reading.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityOutcome {
    pub city: String,
    pub api: SourceOutcome,
    pub scraped: SourceOutcome,
    pub record: Option<ReconciledRecord>,
    pub persisted: bool,
    pub persistence_error: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: CollectionSummary,
    pub outcomes: Vec<CityOutcome>,
}

impl CollectionRun {
    /// Records written during the run, in collection order.
    pub fn records(&self) -> Vec<ReconciledRecord> {
        self.outcomes
            .iter()
            .filter_map(|o| o.record.clone())
            .collect()
    }

    /// Write the run as pretty JSON, creating parent directories.
    pub async fn save_results(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing collection results")?;
        fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "collection results saved");
        Ok(())
    }
}

/// Walks the city list once: both sources per city, merge, upsert.
pub struct Collector {
    api: Box<dyn TemperatureSource>,
    scraper: Box<dyn TemperatureSource>,
    store: ReconciliationStore,
    pacing: Duration,
}

impl Collector {
    pub fn new(
        api: Box<dyn TemperatureSource>,
        scraper: Box<dyn TemperatureSource>,
        store: ReconciliationStore,
    ) -> Self {
        Self {
            api,
            scraper,
            store,
            pacing: DEFAULT_PACING,
        }
    }

    /// Pause between consecutive cities.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    /// Collect every target in order. Only a source that cannot start fails
    /// the run; per-city failures are recorded in the outcomes.
    pub async fn run(&mut self, targets: &[CityTarget]) -> Result<CollectionRun> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collection", %run_id, cities = targets.len());
        self.run_inner(run_id, targets).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, targets: &[CityTarget]) -> Result<CollectionRun> {
        let started_at = Utc::now();

        self.scraper
            .start()
            .await
            .context("starting scrape session")?;
        if let Err(err) = self.api.start().await {
            self.close_sources().await;
            return Err(err).context("starting api client");
        }

        // Sources are closed even if a fetch or the store panics mid-loop.
        let collected = AssertUnwindSafe(self.collect_all(targets))
            .catch_unwind()
            .await;
        self.close_sources().await;
        let (summary, outcomes) = match collected {
            Ok(collected) => collected,
            Err(panic) => {
                error!("collection aborted by a panic; sources closed");
                std::panic::resume_unwind(panic);
            }
        };

        let finished_at = Utc::now();
        info!(
            total = summary.total,
            api_ok = summary.api_ok,
            scrape_ok = summary.scrape_ok,
            both = summary.both,
            persisted = summary.persisted,
            "collection finished"
        );
        Ok(CollectionRun {
            run_id,
            started_at,
            finished_at,
            summary,
            outcomes,
        })
    }

    async fn collect_all(&mut self, targets: &[CityTarget]) -> (CollectionSummary, Vec<CityOutcome>) {
        let mut summary = CollectionSummary::default();
        let mut outcomes = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let outcome = self
                .collect_city(target)
                .instrument(info_span!("city", city = %target.name))
                .await;
            summary.record(
                outcome.api.succeeded(),
                outcome.scraped.succeeded(),
                outcome.persisted,
            );
            outcomes.push(outcome);

            if index + 1 < targets.len() && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }
        (summary, outcomes)
    }

    async fn collect_city(&mut self, target: &CityTarget) -> CityOutcome {
        let api = SourceOutcome::from_result(self.api.fetch(target).await);
        if let Some(error) = &api.error {
            warn!(error = %error, "api reading failed");
        }
        let scraped = SourceOutcome::from_result(self.scraper.fetch(target).await);
        if let Some(error) = &scraped.error {
            warn!(error = %error, "scraped reading failed");
        }

        let update = RecordUpdate::merge(
            target.entity_key(),
            api.reading.as_ref(),
            scraped.reading.as_ref(),
        );
        let (record, persistence_error) = match self.store.upsert(&update).await {
            Ok(record) => (Some(record), None),
            Err(err) => {
                warn!(error = %err, "record not persisted");
                (None, Some(err.to_string()))
            }
        };

        if let Some(diff) = record.as_ref().and_then(ReconciledRecord::discrepancy) {
            info!(discrepancy = diff, "city reconciled");
        }

        CityOutcome {
            city: target.name.clone(),
            api,
            scraped,
            persisted: record.is_some(),
            record,
            persistence_error,
            captured_at: Utc::now(),
        }
    }

    async fn close_sources(&mut self) {
        if let Err(err) = self.scraper.close().await {
            warn!(error = %err, "closing scrape session failed");
        }
        if let Err(err) = self.api.close().await {
            warn!(error = %err, "closing api client failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use tempcheck_core::ReadingSource;
    use tempcheck_sources::NavigationError;

    use super::*;

    #[derive(Default)]
    struct Lifecycle {
        starts: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeSource {
        source: ReadingSource,
        temps: HashMap<String, f64>,
        fail_start: bool,
        panic_on: Option<String>,
        lifecycle: Arc<Lifecycle>,
    }

    impl FakeSource {
        fn new(source: ReadingSource, temps: &[(&str, f64)]) -> (Self, Arc<Lifecycle>) {
            let lifecycle = Arc::new(Lifecycle::default());
            let fake = Self {
                source,
                temps: temps.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                fail_start: false,
                panic_on: None,
                lifecycle: lifecycle.clone(),
            };
            (fake, lifecycle)
        }
    }

    #[async_trait]
    impl TemperatureSource for FakeSource {
        fn source(&self) -> ReadingSource {
            self.source
        }

        async fn start(&mut self) -> Result<(), SourceError> {
            self.lifecycle.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(NavigationError::Startup("no browser".into()).into());
            }
            Ok(())
        }

        async fn fetch(&mut self, target: &CityTarget) -> Result<WeatherReading, SourceError> {
            if self.panic_on.as_deref() == Some(target.name.as_str()) {
                panic!("fetch failed hard on {}", target.name);
            }
            match self.temps.get(&target.name) {
                Some(temp) => Ok(WeatherReading::new(
                    target.entity_key(),
                    *temp,
                    Some(*temp - 1.0),
                    self.source,
                )),
                None => Err(SourceError::Extraction {
                    url: format!("https://site.test/{}", target.name),
                }),
            }
        }

        async fn close(&mut self) -> Result<(), SourceError> {
            self.lifecycle.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn targets(names: &[&str]) -> Vec<CityTarget> {
        names
            .iter()
            .map(|n| CityTarget::new(*n, format!("test/{}", n.to_lowercase())))
            .collect()
    }

    async fn collector(api: FakeSource, scraper: FakeSource) -> Collector {
        let store = ReconciliationStore::connect_in_memory().await.unwrap();
        Collector::new(Box::new(api), Box::new(scraper), store).with_pacing(Duration::ZERO)
    }

    #[tokio::test]
    async fn merges_both_sources_per_city() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[("City1", 20.0), ("City2", 15.0)]);
        let (web, _) = FakeSource::new(ReadingSource::Scraped, &[("City1", 22.0), ("City2", 15.5)]);
        let mut collector = collector(api, web).await;

        let run = collector.run(&targets(&["City1", "City2"])).await.unwrap();
        assert_eq!(run.summary.total, 2);
        assert_eq!(run.summary.both, 2);
        assert_eq!(run.summary.persisted, 2);

        let records = run.records();
        assert_eq!(records[0].entity_key, "City1");
        assert_eq!(records[0].average_temperature, Some(21.0));

        let stats = collector.store().statistics().await.unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 1.25).abs() < 1e-9);
        let flagged = collector.store().discrepancies(1.0).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].entity_key, "City1");
    }

    #[tokio::test]
    async fn scrape_failures_do_not_block_api_results_or_later_cities() {
        let (api, _) = FakeSource::new(
            ReadingSource::Api,
            &[("Paris", 11.0), ("Cairo", 30.0), ("Lagos", 29.0)],
        );
        let (web, lifecycle) = FakeSource::new(ReadingSource::Scraped, &[("Cairo", 31.0), ("Lagos", 28.5)]);
        let mut collector = collector(api, web).await;

        let run = collector.run(&targets(&["Paris", "Cairo", "Lagos"])).await.unwrap();
        let paris = &run.outcomes[0];
        assert!(paris.persisted);
        assert_eq!(paris.scraped.failure, Some(FailureKind::Extraction));
        let record = paris.record.as_ref().unwrap();
        assert_eq!(record.temperature_api, Some(11.0));
        assert_eq!(record.temperature_scraped, None);
        assert_eq!(record.average_temperature, None);

        assert_eq!(run.summary.api_ok, 3);
        assert_eq!(run.summary.scrape_ok, 2);
        assert_eq!(run.summary.both, 2);
        assert_eq!(collector.store().count().await.unwrap(), 3);
        assert_eq!(lifecycle.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cities_with_no_readings_still_get_a_record() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[]);
        let (web, _) = FakeSource::new(ReadingSource::Scraped, &[]);
        let mut collector = collector(api, web).await;

        let run = collector.run(&targets(&["Atlantis"])).await.unwrap();
        assert_eq!(run.summary.neither, 1);
        assert_eq!(run.summary.persisted, 1);
        let stored = collector.store().get("Atlantis").await.unwrap().unwrap();
        assert_eq!(stored.temperature_api, None);
        assert_eq!(stored.temperature_scraped, None);
    }

    #[tokio::test]
    async fn a_session_that_cannot_start_fails_the_run() {
        let (api, api_lifecycle) = FakeSource::new(ReadingSource::Api, &[("Paris", 11.0)]);
        let (mut web, _) = FakeSource::new(ReadingSource::Scraped, &[]);
        web.fail_start = true;
        let mut collector = collector(api, web).await;

        let err = collector.run(&targets(&["Paris"])).await.unwrap_err();
        assert!(format!("{err:#}").contains("starting scrape session"));
        assert_eq!(api_lifecycle.starts.load(Ordering::SeqCst), 0);
        assert_eq!(collector.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn api_start_failure_still_closes_the_scrape_session() {
        let (mut api, _) = FakeSource::new(ReadingSource::Api, &[]);
        api.fail_start = true;
        let (web, web_lifecycle) = FakeSource::new(ReadingSource::Scraped, &[]);
        let mut collector = collector(api, web).await;

        assert!(collector.run(&targets(&["Paris"])).await.is_err());
        assert_eq!(web_lifecycle.starts.load(Ordering::SeqCst), 1);
        assert_eq!(web_lifecycle.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_failures_are_recorded_per_city() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[("Paris", 11.0)]);
        let (web, lifecycle) = FakeSource::new(ReadingSource::Scraped, &[("Paris", 12.0)]);
        let mut collector = collector(api, web).await;
        collector.store().close().await;

        let run = collector.run(&targets(&["Paris"])).await.unwrap();
        assert!(!run.outcomes[0].persisted);
        assert!(run.outcomes[0].persistence_error.is_some());
        assert_eq!(run.summary.both, 1);
        assert_eq!(run.summary.persisted, 0);
        assert_eq!(lifecycle.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pacing_applies_between_cities_only() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[]);
        let (web, _) = FakeSource::new(ReadingSource::Scraped, &[]);
        let mut collector = collector(api, web)
            .await
            .with_pacing(Duration::from_millis(40));

        let started = Instant::now();
        collector.run(&targets(&["A", "B", "C"])).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn no_pause_after_the_last_city() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[("Oslo", 4.0)]);
        let (web, _) = FakeSource::new(ReadingSource::Scraped, &[("Oslo", 4.5)]);
        let mut collector = collector(api, web)
            .await
            .with_pacing(Duration::from_secs(5));

        let started = Instant::now();
        let run = collector.run(&targets(&["Oslo"])).await.unwrap();
        assert_eq!(run.summary.both, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn a_panicking_fetch_still_closes_both_sources() {
        let (api, api_lifecycle) = FakeSource::new(ReadingSource::Api, &[("A", 10.0), ("B", 11.0)]);
        let (mut web, web_lifecycle) = FakeSource::new(ReadingSource::Scraped, &[("A", 10.5)]);
        web.panic_on = Some("B".to_string());
        let mut collector = collector(api, web).await;

        let result = AssertUnwindSafe(collector.run(&targets(&["A", "B"])))
            .catch_unwind()
            .await;
        assert!(result.is_err());
        assert_eq!(web_lifecycle.closes.load(Ordering::SeqCst), 1);
        assert_eq!(api_lifecycle.closes.load(Ordering::SeqCst), 1);
        assert!(collector.store().get("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn results_are_saved_as_json() {
        let (api, _) = FakeSource::new(ReadingSource::Api, &[("Seoul", 9.0)]);
        let (web, _) = FakeSource::new(ReadingSource::Scraped, &[("Seoul", 9.4)]);
        let mut collector = collector(api, web).await;
        let run = collector.run(&targets(&["Seoul"])).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("collection_results.json");
        run.save_results(&path).await.unwrap();

        let saved: CollectionRun =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.run_id, run.run_id);
        assert_eq!(saved.outcomes[0].city, "Seoul");
        assert_eq!(
            saved.outcomes[0].scraped.reading.as_ref().map(|r| r.temperature),
            Some(9.4)
        );
    }
}
