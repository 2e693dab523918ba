//! Read-only axum + askama dashboard over the reconciliation store.

use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tempcheck_core::{DiscrepancyEntry, DiscrepancyStats, ReconciledRecord};
use tempcheck_storage::ReconciliationStore;
use tempcheck_sync::{connect_store, SyncConfig};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "tempcheck-web";

#[derive(Clone)]
pub struct AppState {
    pub store: ReconciliationStore,
    pub default_threshold: f64,
}

impl AppState {
    pub fn new(store: ReconciliationStore, default_threshold: f64) -> Self {
        Self {
            store,
            default_threshold,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdQuery {
    threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscrepancyResponse {
    pub threshold: f64,
    pub entries: Vec<DiscrepancyEntry>,
}

#[derive(Debug, Clone)]
struct RecordRow {
    city: String,
    web: String,
    api: String,
    average: String,
    difference: String,
    updated_at: String,
}

impl RecordRow {
    fn from_record(record: &ReconciledRecord) -> Self {
        Self {
            city: record.entity_key.clone(),
            web: celsius(record.temperature_scraped, 1),
            api: celsius(record.temperature_api, 1),
            average: celsius(record.average_temperature, 2),
            difference: celsius(record.discrepancy(), 2),
            updated_at: record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

fn celsius(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{v:.decimals$}"))
        .unwrap_or_else(|| "n/a".to_string())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    threshold: f64,
    compared: usize,
    mean: String,
    max: String,
    min: String,
    flagged: Vec<RecordRow>,
    records: Vec<RecordRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/records", get(records_handler))
        .route("/api/records/{city}", get(record_handler))
        .route("/api/discrepancies", get(discrepancies_handler))
        .route("/api/statistics", get(statistics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(addr = %listener.local_addr()?, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    serve(AppState::new(store, config.threshold), config.web_port).await
}

impl AppState {
    fn threshold(&self, requested: Option<f64>) -> Result<f64, Response> {
        match requested {
            None => Ok(self.default_threshold),
            Some(t) if t.is_finite() && t >= 0.0 => Ok(t),
            Some(_) => Err(bad_request("threshold must be a non-negative number")),
        }
    }
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThresholdQuery>,
) -> Response {
    let threshold = match state.threshold(query.threshold) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match load_dashboard(&state.store, threshold).await {
        Ok((records, flagged, stats)) => {
            let flagged = flagged
                .iter()
                .filter_map(|entry| records.iter().find(|r| r.entity_key == entry.entity_key))
                .map(RecordRow::from_record)
                .collect();
            render_html(IndexTemplate {
                threshold,
                compared: stats.count,
                mean: format!("{:.2}", stats.mean),
                max: format!("{:.2}", stats.max),
                min: format!("{:.2}", stats.min),
                flagged,
                records: records.iter().map(RecordRow::from_record).collect(),
            })
        }
        Err(err) => server_error(err),
    }
}

async fn load_dashboard(
    store: &ReconciliationStore,
    threshold: f64,
) -> anyhow::Result<(Vec<ReconciledRecord>, Vec<DiscrepancyEntry>, DiscrepancyStats)> {
    Ok((
        store.all().await?,
        store.discrepancies(threshold).await?,
        store.statistics().await?,
    ))
}

async fn records_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.all().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(city): AxumPath<String>,
) -> Response {
    match state.store.get(&city).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no record for {city}") })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn discrepancies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThresholdQuery>,
) -> Response {
    let threshold = match state.threshold(query.threshold) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.store.discrepancies(threshold).await {
        Ok(entries) => Json(DiscrepancyResponse { threshold, entries }).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.statistics().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
