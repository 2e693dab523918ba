//! The page-loading seam the scraper drives.

use std::time::Duration;

use async_trait::async_trait;
use scraper::Html;
use tempcheck_storage::{FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::debug;

use crate::extract::{parse_selector, InvalidSelector};

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("navigator session is not started")]
    NotStarted,
    #[error("no page is open")]
    NoPage,
    #[error("navigator failed to start: {0}")]
    Startup(String),
    #[error("navigation to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("navigation to {url} failed: {source}")]
    Load {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Selector(#[from] InvalidSelector),
}

/// A session that can load pages and hand back their rendered markup.
///
/// Implementations backed by a real browser render scripts; the contract only
/// asks for the document as it stands after `open` and any `wait`.
#[async_trait]
pub trait Navigator: Send {
    async fn start(&mut self) -> Result<(), NavigationError>;

    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError>;

    async fn wait(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn content(&mut self) -> Result<String, NavigationError>;

    /// Trimmed text of the first element matching `selector`.
    async fn query_text(&mut self, selector: &str) -> Result<Option<String>, NavigationError> {
        let html = self.content().await?;
        first_text(&html, selector)
    }

    async fn close(&mut self) -> Result<(), NavigationError>;
}

fn first_text(html: &str, selector: &str) -> Result<Option<String>, NavigationError> {
    let selector = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document.select(&selector).next().and_then(|node| {
        let text = node.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }))
}

struct LoadedPage {
    url: String,
    html: String,
}

/// Plain HTTP navigator: fetches the served markup without running scripts.
pub struct HttpNavigator {
    config: HttpClientConfig,
    fetcher: Option<HttpFetcher>,
    page: Option<LoadedPage>,
}

impl HttpNavigator {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            fetcher: None,
            page: None,
        }
    }

    pub fn current_url(&self) -> Option<&str> {
        self.page.as_ref().map(|p| p.url.as_str())
    }
}

#[async_trait]
impl Navigator for HttpNavigator {
    async fn start(&mut self) -> Result<(), NavigationError> {
        if self.fetcher.is_none() {
            let fetcher = HttpFetcher::new(self.config.clone())
                .map_err(|err| NavigationError::Startup(format!("{err:#}")))?;
            self.fetcher = Some(fetcher);
        }
        Ok(())
    }

    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError> {
        let fetcher = self.fetcher.as_ref().ok_or(NavigationError::NotStarted)?;
        self.page = None;

        let response = tokio::time::timeout(timeout, fetcher.fetch_bytes(url, &[]))
            .await
            .map_err(|_| NavigationError::Timeout {
                url: url.to_string(),
                timeout,
            })?
            .map_err(|source| match source {
                FetchError::Timeout { .. } => NavigationError::Timeout {
                    url: url.to_string(),
                    timeout,
                },
                source => NavigationError::Load {
                    url: url.to_string(),
                    source,
                },
            })?;

        debug!(url = %response.final_url, bytes = response.body.len(), "page loaded");
        self.page = Some(LoadedPage {
            url: response.final_url.clone(),
            html: response.text(),
        });
        Ok(())
    }

    async fn content(&mut self) -> Result<String, NavigationError> {
        if self.fetcher.is_none() {
            return Err(NavigationError::NotStarted);
        }
        self.page
            .as_ref()
            .map(|p| p.html.clone())
            .ok_or(NavigationError::NoPage)
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        self.page = None;
        self.fetcher = None;
        Ok(())
    }
}
