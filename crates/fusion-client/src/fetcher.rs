//! Bootstrap fetch seam.
//!
//! The initial value of a subscription comes from a plain HTTP request that
//! opts into publication (`x-fusion-publish: 1`). The server answers with the
//! value as JSON and names the publication in the `x-fusion-publication`
//! response header:
//!
//! ```text
//! x-fusion-publication: {"PublicationRef":{"PublisherId":"P1","PublicationId":"U1"}}
//! ```
//!
//! [`HttpFetcher`] is the `reqwest` implementation; anything implementing
//! [`Fetcher`] (or a closure wrapped with [`fetcher_fn`]) can stand in.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use fusion_core::constants::{PUBLICATION_RESPONSE_HEADER, PUBLISH_REQUEST_HEADER};
use fusion_core::{FusionError, PublicationRef, Result};

/// Extra request parameters for the bootstrap fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchParams {
    /// Additional request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query string parameters.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl FetchParams {
    /// Add a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.query.insert(name.into(), value.into());
        self
    }
}

/// Parsed `x-fusion-publication` header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublicationHeader {
    /// The publication this response subscribes to.
    #[serde(default)]
    pub publication_ref: Option<PublicationRef>,
}

impl PublicationHeader {
    /// Header naming `publication`.
    pub fn new(publication: PublicationRef) -> Self {
        Self {
            publication_ref: Some(publication),
        }
    }

    /// Parse the header text. Malformed JSON is a protocol error.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| FusionError::Protocol(format!("malformed publication header: {e}")))
    }
}

/// Body plus publication header of a bootstrap response.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    /// The response body.
    pub data: Value,
    /// The publication header, when the response carried one.
    pub header: Option<PublicationHeader>,
}

impl FetchResponse {
    /// A response that names `publication`.
    pub fn published(data: Value, publication: PublicationRef) -> Self {
        Self {
            data,
            header: Some(PublicationHeader::new(publication)),
        }
    }
}

/// Performs the bootstrap request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, returning the body and publication header.
    async fn fetch(&self, url: &str, params: &FetchParams) -> Result<FetchResponse>;
}

/// [`Fetcher`] backed by a closure.
pub struct FnFetcher<F>(F);

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(String, FetchParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchResponse>> + Send,
{
    async fn fetch(&self, url: &str, params: &FetchParams) -> Result<FetchResponse> {
        (self.0)(url.to_owned(), params.clone()).await
    }
}

/// Wrap a closure as a shared [`Fetcher`].
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn Fetcher>
where
    F: Fn(String, FetchParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FetchResponse>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}

/// HTTP fetcher over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<reqwest::Url>,
}

impl HttpFetcher {
    /// Fetcher with a default client. Request URLs must be absolute.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Fetcher with a caller-configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Resolve relative request URLs against `base`.
    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let base = reqwest::Url::parse(base)
            .map_err(|e| FusionError::InvalidEndpoint(format!("{base}: {e}")))?;
        self.base_url = Some(base);
        Ok(self)
    }

    fn resolve(&self, url: &str) -> Result<reqwest::Url> {
        let resolved = match &self.base_url {
            Some(base) => base.join(url),
            None => reqwest::Url::parse(url),
        };
        resolved.map_err(|e| FusionError::InvalidEndpoint(format!("{url}: {e}")))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, params: &FetchParams) -> Result<FetchResponse> {
        let target = self.resolve(url)?;
        let mut request = self.client.get(target).header(PUBLISH_REQUEST_HEADER, "1");
        for (name, value) in &params.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !params.query.is_empty() {
            request = request.query(&params.query);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FusionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FusionError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("Network response was not ok")
                    .to_string(),
            });
        }

        let header = match response.headers().get(PUBLICATION_RESPONSE_HEADER) {
            Some(value) => {
                let text = value.to_str().map_err(|_| {
                    FusionError::Protocol("publication header is not valid text".into())
                })?;
                Some(PublicationHeader::parse(text)?)
            }
            None => None,
        };

        let data: Value = response
            .json()
            .await
            .map_err(|e| FusionError::Network(e.to_string()))?;

        debug!(url, published = header.is_some(), "bootstrap response");
        Ok(FetchResponse { data, header })
    }
}
