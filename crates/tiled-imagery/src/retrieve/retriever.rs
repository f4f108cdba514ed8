//! Retriever traits and the HTTP retriever.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::geom::Sector;
use crate::retrieve::NetworkStatus;

/// Future type for retrieval operations.
pub type RetrieveFuture<'a> = Pin<Box<dyn Future<Output = Result<RetrievedContent>> + Send + 'a>>;

/// Payload produced by a retriever.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContent {
    /// MIME type reported by the source, if any.
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl RetrievedContent {
    #[must_use]
    pub fn new(content_type: Option<String>, data: Vec<u8>) -> Self {
        Self { content_type, data }
    }

    /// Whether the payload is textual, which for tile data means the source
    /// answered with an error page.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.content_type.as_deref().is_some_and(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text") || ct.contains("xml") || ct.contains("html")
        })
    }
}

/// Something that can fetch one resource.
pub trait Retriever: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn retrieve(&self) -> RetrieveFuture<'_>;

    /// Requests still queued after this long are dropped instead of run.
    fn stale_request_limit(&self) -> Option<Duration> {
        None
    }
}

/// Attributes handed to a local retriever factory for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRetrievalRequest {
    pub sector: Sector,
    pub width: u32,
    pub height: u32,
    /// File-store path the result will be written to.
    pub file_name: String,
}

/// Creates retrievers that produce tiles without going to the network,
/// e.g. by rendering or reprojecting local data.
pub trait RetrieverFactory: Send + Sync {
    fn create_retriever(&self, request: &LocalRetrievalRequest) -> Option<Arc<dyn Retriever>>;
}

/// Handles the outcome of a retrieval. Returns the number of bytes kept.
pub trait RetrievalPostProcessor: Send + Sync {
    fn process(&self, outcome: Result<RetrievedContent>) -> Result<usize>;
}

/// HTTP retriever for a single URL.
pub struct UrlRetriever {
    http: reqwest::Client,
    url: reqwest::Url,
    name: String,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    stale_request_limit: Option<Duration>,
    network: Arc<NetworkStatus>,
}

impl UrlRetriever {
    #[must_use]
    pub fn new(http: reqwest::Client, url: reqwest::Url, network: Arc<NetworkStatus>) -> Self {
        Self {
            name: url.to_string(),
            http,
            url,
            connect_timeout: None,
            read_timeout: None,
            stale_request_limit: None,
            network,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stale_request_limit(mut self, limit: Option<Duration>) -> Self {
        self.stale_request_limit = limit;
        self
    }

    #[must_use]
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    fn http_error(&self, e: &reqwest::Error) -> Error {
        if e.is_connect() || e.is_timeout() {
            self.network.add_unavailable_host(self.host());
        }
        Error::Http {
            url: self.name.clone(),
            message: e.to_string(),
        }
    }

    async fn fetch(&self) -> Result<RetrievedContent> {
        tracing::debug!(url = %self.url, "fetching");

        let send = self.http.get(self.url.clone()).send();
        let response = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.map_err(|_| {
                self.network.add_unavailable_host(self.host());
                Error::Http {
                    url: self.name.clone(),
                    message: format!("connect timed out after {limit:?}"),
                }
            })?,
            None => send.await,
        }
        .map_err(|e| self.http_error(&e))?;
        self.network.add_available_host(self.host());

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: self.name.clone(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes();
        let data = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, body).await.map_err(|_| Error::Http {
                url: self.name.clone(),
                message: format!("read timed out after {limit:?}"),
            })?,
            None => body.await,
        }
        .map_err(|e| self.http_error(&e))?;

        Ok(RetrievedContent::new(content_type, data.to_vec()))
    }
}

impl Retriever for UrlRetriever {
    fn name(&self) -> &str {
        &self.name
    }

    fn retrieve(&self) -> RetrieveFuture<'_> {
        Box::pin(self.fetch())
    }

    fn stale_request_limit(&self) -> Option<Duration> {
        self.stale_request_limit
    }
}

impl std::fmt::Debug for UrlRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlRetriever")
            .field("url", &self.name)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("stale_request_limit", &self.stale_request_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_detection() {
        let page = RetrievedContent::new(Some("text/html; charset=utf-8".into()), vec![b'<']);
        let xml = RetrievedContent::new(Some("application/vnd.ogc.se_xml".into()), vec![]);
        let image = RetrievedContent::new(Some("image/dds".into()), vec![0]);
        let unknown = RetrievedContent::new(None, vec![0]);

        assert!(page.is_text());
        assert!(xml.is_text());
        assert!(!image.is_text());
        assert!(!unknown.is_text());
    }

    #[tokio::test]
    async fn test_unreachable_host_marks_network_status() {
        let network = Arc::new(NetworkStatus::with_limits(1, Duration::from_secs(60)));
        let url = reqwest::Url::parse("http://127.0.0.1:9/tile.dds").unwrap();
        let retriever = UrlRetriever::new(reqwest::Client::new(), url.clone(), Arc::clone(&network))
            .with_connect_timeout(Some(Duration::from_secs(5)));

        assert!(retriever.retrieve().await.is_err());
        assert!(!network.is_url_available(&url));
    }
}
