//! Retrieval functions consumed by the fetch engine
//!
//! The engine only knows that a retrieval may fail and may be retried. Anything that can
//! turn an identifier into a record implements [`Retriever`]; it is shared across all
//! workers of a batch, so implementations must be safe for concurrent use.

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;

/// Turns one identifier into a record
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Record produced by a successful retrieval
    type Record: Send + 'static;

    /// Perform a single attempt for `identifier`
    ///
    /// Called once per attempt; the retry policy decides whether to call again.
    /// The returned future may be dropped mid-flight when the batch is cancelled.
    async fn retrieve(&self, identifier: &str) -> Result<Self::Record>;
}

/// Adapter turning an async closure into a [`Retriever`]
///
/// # Example
///
/// ```
/// use batch_fetch::retriever::FnRetriever;
///
/// let retriever = FnRetriever::new(|id: String| async move {
///     Ok::<_, batch_fetch::Error>(id.len())
/// });
/// # let _ = retriever;
/// ```
pub struct FnRetriever<F> {
    func: F,
}

impl<F> FnRetriever<F> {
    /// Wrap `func`, which receives an owned copy of each identifier
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut, T> Retriever for FnRetriever<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    type Record = T;

    async fn retrieve(&self, identifier: &str) -> Result<T> {
        (self.func)(identifier.to_string()).await
    }
}

/// Body of a successfully fetched URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedPage {
    /// The URL that was requested
    pub url: String,
    /// HTTP status code (always 200)
    pub status: u16,
    /// Response body as text
    pub body: String,
}

/// Retriever that GETs each identifier as a URL
///
/// Anything but `200 OK` is reported as [`Error::HttpStatus`]. Parsing the body is left to
/// the caller.
#[derive(Clone, Debug)]
pub struct HttpRetriever {
    client: reqwest::Client,
}

impl HttpRetriever {
    /// Build a retriever from HTTP settings (proxy, timeout, user agent)
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone());

        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::config("http.proxy", format!("invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| Error::config("http", format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Use an already configured reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    type Record = FetchedPage;

    async fn retrieve(&self, identifier: &str) -> Result<FetchedPage> {
        let url = url::Url::parse(identifier).map_err(|e| Error::InvalidUrl {
            url: identifier.to_string(),
            reason: e.to_string(),
        })?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                url: identifier.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        tracing::debug!(url = identifier, bytes = body.len(), "Fetched URL");

        Ok(FetchedPage {
            url: identifier.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
