//! Report artifacts rendered from the reconciliation store.

use std::path::{Path, PathBuf};

use askama::Template;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempcheck_core::{DiscrepancyEntry, DiscrepancyStats, ReconciledRecord};
use tempcheck_storage::{ReconciliationStore, StoreError};
use thiserror::Error;
use tokio::fs;
use tracing::info;

pub const REPORT_TITLE: &str = "Temperature Discrepancy Analysis Report";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reading report data: {0}")]
    Store(#[from] StoreError),
    #[error("writing {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("rendering html report: {0}")]
    Template(#[from] askama::Error),
}

/// Everything a report is rendered from, captured once so every artifact of a
/// run agrees.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub generated_at: DateTime<Utc>,
    pub threshold: f64,
    pub records: Vec<ReconciledRecord>,
    pub discrepancies: Vec<DiscrepancyEntry>,
    pub statistics: DiscrepancyStats,
    /// Number of cities in the registry; the denominator of the success rate.
    pub configured_cities: usize,
}

impl ReportInput {
    pub async fn from_store(
        store: &ReconciliationStore,
        threshold: f64,
        configured_cities: usize,
        generated_at: DateTime<Utc>,
    ) -> Result<Self, ReportError> {
        Ok(Self {
            generated_at,
            threshold,
            records: store.all().await?,
            discrepancies: store.discrepancies(threshold).await?,
            statistics: store.statistics().await?,
            configured_cities,
        })
    }

    fn generated(&self) -> String {
        self.generated_at.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn record(&self, entity_key: &str) -> Option<&ReconciledRecord> {
        self.records.iter().find(|r| r.entity_key == entity_key)
    }

    pub fn success_rate(&self) -> f64 {
        if self.configured_cities == 0 {
            return 0.0;
        }
        self.statistics.count as f64 / self.configured_cities as f64 * 100.0
    }
}

/// `2.0` rather than `2`, so file names and headings read as temperatures.
pub fn format_threshold(threshold: f64) -> String {
    if threshold.fract() == 0.0 {
        format!("{threshold:.1}")
    } else {
        threshold.to_string()
    }
}

fn celsius(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}")).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub title: String,
    pub generated: String,
    pub threshold: f64,
    pub total_cities_analyzed: usize,
    pub cities_above_threshold: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryStatistics {
    pub total_cities: usize,
    pub mean_discrepancy: f64,
    pub max_discrepancy: f64,
    pub min_discrepancy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscrepantCity {
    pub city: String,
    pub temperature_web: f64,
    pub feels_like_web: Option<f64>,
    pub temperature_api: f64,
    pub feels_like_api: Option<f64>,
    pub avg_temperature: Option<f64>,
    pub discrepancy: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub metadata: ReportMetadata,
    pub summary_statistics: SummaryStatistics,
    pub cities_with_discrepancies: Vec<DiscrepantCity>,
}

impl AnalysisReport {
    pub fn build(input: &ReportInput) -> Self {
        let stats = &input.statistics;
        Self {
            metadata: ReportMetadata {
                title: REPORT_TITLE.to_string(),
                generated: input.generated(),
                threshold: input.threshold,
                total_cities_analyzed: stats.count,
                cities_above_threshold: input.discrepancies.len(),
            },
            summary_statistics: SummaryStatistics {
                total_cities: stats.count,
                mean_discrepancy: stats.mean,
                max_discrepancy: stats.max,
                min_discrepancy: stats.min,
            },
            cities_with_discrepancies: input
                .discrepancies
                .iter()
                .map(|entry| {
                    let record = input.record(&entry.entity_key);
                    DiscrepantCity {
                        city: entry.entity_key.clone(),
                        temperature_web: entry.temperature_scraped,
                        feels_like_web: record.and_then(|r| r.feels_like_scraped),
                        temperature_api: entry.temperature_api,
                        feels_like_api: record.and_then(|r| r.feels_like_api),
                        avg_temperature: record.and_then(|r| r.average_temperature),
                        discrepancy: entry.absolute_difference,
                        timestamp: record.map(|r| r.updated_at),
                    }
                })
                .collect(),
        }
    }
}

struct HtmlRow {
    city: String,
    web: String,
    api: String,
    difference: String,
}

#[derive(Template)]
#[template(path = "weather_report.html")]
struct WeatherReportTemplate {
    generated: String,
    threshold: String,
    rows: Vec<HtmlRow>,
    compared: usize,
    mean: String,
    max: String,
    min: String,
}

pub fn render_discrepancy_csv(input: &ReportInput) -> Result<String, ReportError> {
    let mut out = Vec::new();
    {
        let mut preamble = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(&mut out);
        preamble.write_record(["# Temperature Discrepancy Report"])?;
        preamble.write_record(["# Generated:", input.generated().as_str()])?;
        preamble.write_record([
            "# Threshold:",
            format!("{}C", format_threshold(input.threshold)).as_str(),
        ])?;
        preamble.write_record([
            "# Cities above threshold:",
            input.discrepancies.len().to_string().as_str(),
        ])?;
        preamble.flush()?;
    }
    out.push(b'\n');
    {
        let mut table = csv::WriterBuilder::new().from_writer(&mut out);
        table.write_record([
            "City",
            "Web_Temp_C",
            "API_Temp_C",
            "Discrepancy_C",
            "Web_FeelsLike_C",
            "API_FeelsLike_C",
            "Avg_Temp_C",
        ])?;
        for entry in &input.discrepancies {
            let record = input.record(&entry.entity_key);
            table.write_record([
                entry.entity_key.clone(),
                format!("{:.1}", entry.temperature_scraped),
                format!("{:.1}", entry.temperature_api),
                format!("{:.2}", entry.absolute_difference),
                celsius(record.and_then(|r| r.feels_like_scraped)),
                celsius(record.and_then(|r| r.feels_like_api)),
                record
                    .and_then(|r| r.average_temperature)
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_default(),
            ])?;
        }
        table.flush()?;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn render_statistics_csv(input: &ReportInput) -> Result<String, ReportError> {
    let stats = &input.statistics;
    let mut out = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(&mut out);
        writer.write_record(["Temperature Analysis Statistics Report"])?;
        writer.write_record(["Generated:", input.generated().as_str()])?;
        writer.write_record([
            "Threshold:",
            format!("{}C", format_threshold(input.threshold)).as_str(),
        ])?;
        writer.flush()?;
    }
    out.push(b'\n');
    {
        let mut writer = csv::WriterBuilder::new().from_writer(&mut out);
        writer.write_record(["Metric", "Value", "Unit"])?;
        let rows = [
            ("Total Cities Analyzed", stats.count.to_string(), "count"),
            ("Mean Discrepancy", format!("{:.2}", stats.mean), "Celsius"),
            ("Maximum Discrepancy", format!("{:.2}", stats.max), "Celsius"),
            ("Minimum Discrepancy", format!("{:.2}", stats.min), "Celsius"),
            (
                "Cities Above Threshold",
                input.discrepancies.len().to_string(),
                "count",
            ),
            ("Success Rate", format!("{:.1}", input.success_rate()), "percent"),
        ];
        for (metric, value, unit) in rows {
            writer.write_record([metric, value.as_str(), unit])?;
        }
        writer.flush()?;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn render_html(input: &ReportInput) -> Result<String, ReportError> {
    let stats = &input.statistics;
    let template = WeatherReportTemplate {
        generated: input.generated(),
        threshold: format_threshold(input.threshold),
        rows: input
            .discrepancies
            .iter()
            .map(|entry| HtmlRow {
                city: entry.entity_key.clone(),
                web: format!("{:.1}", entry.temperature_scraped),
                api: format!("{:.1}", entry.temperature_api),
                difference: format!("{:.2}", entry.absolute_difference),
            })
            .collect(),
        compared: stats.count,
        mean: format!("{:.2}", stats.mean),
        max: format!("{:.2}", stats.max),
        min: format!("{:.2}", stats.min),
    };
    Ok(template.render()?)
}

pub fn render_markdown(input: &ReportInput) -> String {
    let stats = &input.statistics;
    let threshold = format_threshold(input.threshold);
    let mut lines = vec![
        "# Temperature Discrepancy Report".to_string(),
        String::new(),
        format!("- Generated: {}", input.generated()),
        format!("- Cities compared: {}", stats.count),
        String::new(),
        format!("## Cities with > {threshold}C discrepancy"),
        String::new(),
    ];
    if input.discrepancies.is_empty() {
        lines.push("None.".to_string());
    }
    for entry in &input.discrepancies {
        lines.push(format!(
            "- {}: Web={:.1}C, API={:.1}C, Diff={:.2}C",
            entry.entity_key,
            entry.temperature_scraped,
            entry.temperature_api,
            entry.absolute_difference
        ));
    }
    lines.extend([
        String::new(),
        "## Summary Statistics".to_string(),
        format!("- Mean discrepancy: {:.2}C", stats.mean),
        format!("- Max discrepancy: {:.2}C", stats.max),
        format!("- Min discrepancy: {:.2}C", stats.min),
        String::new(),
    ]);
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportFiles {
    pub dir: PathBuf,
    pub discrepancy_csv: PathBuf,
    pub statistics_csv: PathBuf,
    pub analysis_json: PathBuf,
    pub html: PathBuf,
    pub markdown: PathBuf,
}

impl ReportFiles {
    pub fn all(&self) -> [&Path; 5] {
        [
            self.discrepancy_csv.as_path(),
            self.statistics_csv.as_path(),
            self.analysis_json.as_path(),
            self.html.as_path(),
            self.markdown.as_path(),
        ]
    }
}

/// Writes one timestamped directory of report artifacts per call.
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    reports_dir: PathBuf,
}

impl ReportEmitter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, generated_at: DateTime<Utc>) -> PathBuf {
        self.reports_dir
            .join(generated_at.format("%Y%m%d_%H%M%S").to_string())
    }

    pub async fn emit(&self, input: &ReportInput) -> Result<ReportFiles, ReportError> {
        let dir = self.run_dir(input.generated_at);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| ReportError::File {
                path: dir.clone(),
                source,
            })?;

        let files = ReportFiles {
            discrepancy_csv: dir.join(format!(
                "discrepancies_above_{}C.csv",
                format_threshold(input.threshold)
            )),
            statistics_csv: dir.join("temperature_statistics.csv"),
            analysis_json: dir.join("temperature_analysis.json"),
            html: dir.join("weather_report.html"),
            markdown: dir.join("report.md"),
            dir,
        };

        write_file(&files.discrepancy_csv, render_discrepancy_csv(input)?).await?;
        write_file(&files.statistics_csv, render_statistics_csv(input)?).await?;
        let json = serde_json::to_string_pretty(&AnalysisReport::build(input))?;
        write_file(&files.analysis_json, json).await?;
        write_file(&files.html, render_html(input)?).await?;
        write_file(&files.markdown, render_markdown(input)).await?;

        info!(
            dir = %files.dir.display(),
            above_threshold = input.discrepancies.len(),
            "reports written"
        );
        Ok(files)
    }
}

async fn write_file(path: &Path, contents: String) -> Result<(), ReportError> {
    fs::write(path, contents)
        .await
        .map_err(|source| ReportError::File {
            path: path.to_path_buf(),
            source,
        })
}
