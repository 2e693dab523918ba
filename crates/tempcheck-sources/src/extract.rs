//! Layered temperature extraction from rendered weather pages.
//!
//! A [`Cascade`] runs its strategies in order and keeps the first candidate that
//! is inside the plausible Celsius range. The built-in cascades try CSS
//! selectors first, then free-text patterns, then embedded JSON-LD.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tempcheck_core::{is_plausible_celsius, round1, DEFAULT_FEELS_LIKE_MAX_DEVIATION};
use thiserror::Error;
use tracing::debug;

pub const TEMPERATURE_SELECTORS: &[&str] = &[
    r#"[data-module="weather"] .temp"#,
    ".weather-info .temp",
    ".temperature",
    ".temp",
    "span.h2",
    ".cur-weather .h2",
    "#qlook .h2",
];

pub const FEELS_LIKE_SELECTORS: &[&str] = &[
    r#"[data-module="weather"] .feels-like"#,
    ".feels-like",
    ".real-feel",
    ".apparent-temp",
];

const NUM: &str = r"(-?\b\d{1,2}(?:\.\d+)?\b)";

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("number pattern compiles"));

static JSON_LD: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("json-ld selector parses")
});

static TEMPERATURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_builtin(&[
        format!(r"(?i){NUM}\s*°\s*[CF]"),
        format!(r"(?i)temperature[:\s]*{NUM}"),
        format!(r"(?i){NUM}\s*degrees?\b"),
    ])
});

static FEELS_LIKE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_builtin(&[
        format!(r"(?i)feels?\s*like[:\s]*{NUM}"),
        format!(r"(?i)real\s*feel®?[:\s]*{NUM}"),
        format!(r"(?i)apparent(?:\s+temperature)?[:\s]*{NUM}"),
    ])
});

fn compile_builtin(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("built-in pattern compiles"))
        .collect()
}

#[derive(Debug, Clone, Error)]
#[error("invalid selector `{selector}`: {message}")]
pub struct InvalidSelector {
    pub selector: String,
    pub message: String,
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, InvalidSelector> {
    Selector::parse(selector).map_err(|e| InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Pull the first number out of a text fragment, ignoring degree signs, unit
/// letters and whitespace.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .filter(|c| !c.is_whitespace() && !matches!(c, '°' | 'C' | 'F' | 'c' | 'f'))
        .collect();
    NUMBER.find(&cleaned)?.as_str().parse().ok()
}

/// Temperature of a raw page with the default cascade. Absent content yields
/// nothing.
pub fn extract_temperature(raw: Option<&str>) -> Option<f64> {
    ReadingExtractor::default().extract_temperature(raw?)
}

/// A parsed page plus its visible text (script and style bodies excluded).
pub struct PageSnapshot {
    document: Html,
    text: String,
}

impl PageSnapshot {
    pub fn parse(raw: &str) -> Self {
        let document = Html::parse_document(raw);
        let text = visible_text(&document);
        Self { document, text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn select_texts(&self, selector: &Selector) -> Vec<String> {
        self.document
            .select(selector)
            .filter_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
            .collect()
    }

    pub fn first_text(&self, selector: &Selector) -> Option<String> {
        self.select_texts(selector).into_iter().next()
    }

    pub fn json_ld_blocks(&self) -> Vec<JsonValue> {
        self.document
            .select(&JSON_LD)
            .filter_map(|node| {
                let raw = node.text().collect::<String>();
                match serde_json::from_str::<JsonValue>(&raw) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        debug!(error = %err, "skipping unparseable json-ld block");
                        None
                    }
                }
            })
            .collect()
    }
}

fn visible_text(document: &Html) -> String {
    let parts: Vec<&str> = document
        .root_element()
        .descendants()
        .filter(|node| {
            node.parent()
                .and_then(|parent| parent.value().as_element())
                .map_or(true, |el| !matches!(el.name(), "script" | "style" | "noscript"))
        })
        .filter_map(|node| node.value().as_text())
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .collect();
    parts.join(" ").replace('\u{2212}', "-")
}

pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every number the strategy finds, in page order, before range checks.
    fn candidates(&self, page: &PageSnapshot) -> Vec<f64>;
}

pub struct SelectorStrategy {
    name: &'static str,
    selectors: Vec<Selector>,
}

impl SelectorStrategy {
    pub fn new(name: &'static str, selectors: &[&str]) -> Result<Self, InvalidSelector> {
        let selectors = selectors
            .iter()
            .map(|s| parse_selector(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { name, selectors })
    }
}

impl ExtractionStrategy for SelectorStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn candidates(&self, page: &PageSnapshot) -> Vec<f64> {
        self.selectors
            .iter()
            .flat_map(|sel| page.select_texts(sel))
            .filter_map(|text| parse_number(&text))
            .collect()
    }
}

/// Regexes over the page's visible text; capture group 1 is the number.
pub struct PatternStrategy {
    name: &'static str,
    patterns: Vec<Regex>,
}

impl PatternStrategy {
    pub fn new(name: &'static str, patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { name, patterns })
    }

    fn from_compiled(name: &'static str, patterns: Vec<Regex>) -> Self {
        Self { name, patterns }
    }
}

impl ExtractionStrategy for PatternStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn candidates(&self, page: &PageSnapshot) -> Vec<f64> {
        self.patterns
            .iter()
            .flat_map(|re| re.captures_iter(page.text()))
            .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
            .collect()
    }
}

/// Walks JSON-LD blocks for keys containing one of `include` and none of
/// `exclude` (case-insensitive). A matching key holding an object contributes
/// its `value` field.
pub struct JsonLdStrategy {
    name: &'static str,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl JsonLdStrategy {
    pub fn new(name: &'static str, include: &[&str], exclude: &[&str]) -> Self {
        Self {
            name,
            include: include.iter().map(|s| s.to_lowercase()).collect(),
            exclude: exclude.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    fn key_matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.include.iter().any(|frag| key.contains(frag.as_str()))
            && !self.exclude.iter().any(|frag| key.contains(frag.as_str()))
    }

    fn collect(&self, value: &JsonValue, under_match: bool, out: &mut Vec<f64>) {
        match value {
            JsonValue::Object(map) => {
                for (key, child) in map {
                    let matched = self.key_matches(key) || (under_match && key == "value");
                    if matched {
                        if let Some(number) = json_number(child) {
                            out.push(number);
                            continue;
                        }
                    }
                    self.collect(child, matched, out);
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    self.collect(item, under_match, out);
                }
            }
            _ => {}
        }
    }
}

fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_number(s),
        _ => None,
    }
}

impl ExtractionStrategy for JsonLdStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn candidates(&self, page: &PageSnapshot) -> Vec<f64> {
        let mut out = Vec::new();
        for block in page.json_ld_blocks() {
            self.collect(&block, false, &mut out);
        }
        out
    }
}

pub struct Cascade {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Cascade {
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn temperature() -> Self {
        Self::new(vec![
            Box::new(
                SelectorStrategy::new("selector", TEMPERATURE_SELECTORS)
                    .expect("built-in selectors parse"),
            ),
            Box::new(PatternStrategy::from_compiled(
                "pattern",
                TEMPERATURE_PATTERNS.clone(),
            )),
            Box::new(JsonLdStrategy::new("json-ld", &["temp"], &["feel", "apparent"])),
        ])
    }

    pub fn feels_like() -> Self {
        Self::new(vec![
            Box::new(
                SelectorStrategy::new("selector", FEELS_LIKE_SELECTORS)
                    .expect("built-in selectors parse"),
            ),
            Box::new(PatternStrategy::from_compiled(
                "pattern",
                FEELS_LIKE_PATTERNS.clone(),
            )),
            Box::new(JsonLdStrategy::new("json-ld", &["feel", "apparent"], &[])),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn attempt(&self, page: &PageSnapshot) -> Option<(f64, &'static str)> {
        self.attempt_where(page, |_| true)
    }

    /// First plausible candidate that also satisfies `accept`, with the name of
    /// the strategy that produced it.
    pub fn attempt_where(
        &self,
        page: &PageSnapshot,
        accept: impl Fn(f64) -> bool,
    ) -> Option<(f64, &'static str)> {
        self.strategies.iter().find_map(|strategy| {
            strategy
                .candidates(page)
                .into_iter()
                .find(|v| is_plausible_celsius(*v) && accept(*v))
                .map(|v| (v, strategy.name()))
        })
    }

    /// The first number any strategy saw, plausible or not.
    pub fn first_candidate(&self, page: &PageSnapshot) -> Option<f64> {
        self.strategies
            .iter()
            .find_map(|strategy| strategy.candidates(page).into_iter().next())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReading {
    pub temperature: f64,
    /// Falls back to `temperature` when no plausible feels-like value is found.
    pub feels_like: f64,
    pub temperature_strategy: &'static str,
    pub feels_like_strategy: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtractionMiss {
    NotFound,
    Implausible { value: f64 },
}

pub struct ReadingExtractor {
    temperature: Cascade,
    feels_like: Cascade,
    feels_like_max_deviation: f64,
}

impl Default for ReadingExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_FEELS_LIKE_MAX_DEVIATION)
    }
}

impl ReadingExtractor {
    pub fn new(feels_like_max_deviation: f64) -> Self {
        Self::with_cascades(
            Cascade::temperature(),
            Cascade::feels_like(),
            feels_like_max_deviation,
        )
    }

    pub fn with_cascades(
        temperature: Cascade,
        feels_like: Cascade,
        feels_like_max_deviation: f64,
    ) -> Self {
        Self {
            temperature,
            feels_like,
            feels_like_max_deviation,
        }
    }

    pub fn extract_temperature(&self, raw: &str) -> Option<f64> {
        let page = PageSnapshot::parse(raw);
        self.temperature.attempt(&page).map(|(v, _)| round1(v))
    }

    pub fn extract(&self, raw: &str) -> Result<ExtractedReading, ExtractionMiss> {
        let page = PageSnapshot::parse(raw);
        let Some((temperature, temperature_strategy)) = self.temperature.attempt(&page) else {
            return Err(match self.temperature.first_candidate(&page) {
                Some(value) => ExtractionMiss::Implausible { value },
                None => ExtractionMiss::NotFound,
            });
        };

        let max_deviation = self.feels_like_max_deviation;
        let feels = self
            .feels_like
            .attempt_where(&page, |v| (v - temperature).abs() <= max_deviation);
        if feels.is_none() {
            debug!(temperature, "no plausible feels-like value; using temperature");
        }

        Ok(ExtractedReading {
            temperature: round1(temperature),
            feels_like: round1(feels.map_or(temperature, |(v, _)| v)),
            temperature_strategy,
            feels_like_strategy: feels.map(|(_, name)| name),
        })
    }
}
