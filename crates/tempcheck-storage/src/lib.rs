//! Reconciliation store, raw page archive and HTTP fetch utilities for tempcheck.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tempcheck_core::slugify;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod store;

pub use store::{ReconciliationStore, StoreError};

pub const CRATE_NAME: &str = "tempcheck-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed archive of rendered pages, kept so extraction misses can be
/// inspected after a run.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn page_relative_path(
        captured_at: DateTime<Utc>,
        entity_key: &str,
        content_hash: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let slug = slugify(entity_key);
        let slug = if slug.is_empty() { "unnamed".to_string() } else { slug };
        PathBuf::from(day).join(slug).join(format!("{content_hash}.html"))
    }

    /// Write `html` under its hash; identical content for the same city and day is
    /// stored once. The write goes through a temp file and a rename.
    pub async fn store_page(
        &self,
        captured_at: DateTime<Utc>,
        entity_key: &str,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(html.as_bytes());
        let relative_path = Self::page_relative_path(captured_at, entity_key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, html.as_bytes())
            .await
            .with_context(|| format!("writing temp page {}", temp_path.display()))?;

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(archived(true));
            }
            return Err(err).with_context(|| {
                format!(
                    "renaming archived page {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(archived(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper: one attempt per call, bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` with `query` appended. Query values are kept out of the log span
    /// since they may carry credentials.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| classify_request_error(err, url))?;

            let status = resp.status();
            let final_url = without_query(resp.url());
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| classify_request_error(err, url))?
                .to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify_request_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err.without_url())
    }
}

fn without_query(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_pages_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-10-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(captured_at, "New York", "<html>22°C</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(captured_at, "New York", "<html>22°C</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20261001/new-york"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch_bytes(&format!("{}/weather", server.uri()), &[("appid", "secret".into())])
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 401);
                assert!(!url.contains("secret"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_parameters_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(query_param("q", "Rio de Janeiro"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher
            .fetch_bytes(
                &format!("{}/weather", server.uri()),
                &[("q", "Rio de Janeiro".into())],
            )
            .await
            .unwrap();
        assert_eq!(resp.text(), "ok");
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            user_agent: None,
        })
        .unwrap();
        let err = fetcher.fetch_bytes(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }
}
