//! HTTP fetch capability for dataset downloads.
//!
//! The update pipeline depends on the [`Fetch`] trait rather than a
//! concrete client so tests can script responses without a network.
//! Requests are conditional: the caller passes the change token from the
//! previous successful download and a 304 comes back as a distinguishable
//! [`FetchOutcome::NotModified`], not an error.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Result of one conditional fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The origin reported the content unchanged since `change_token`.
    NotModified,
    /// A fresh body, along with the origin's new change token if it sent
    /// one.
    Fetched {
        body: Vec<u8>,
        change_token: Option<String>,
    },
}

/// Conditional GET capability: URL in, bytes plus change token out.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        change_token: Option<&str>,
    ) -> impl Future<Output = Result<FetchOutcome>> + Send;
}

/// Production fetcher with a fixed overall timeout covering the entire
/// transfer, not just connection establishment.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, change_token: Option<&str>) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(token) = change_token {
            request = request.header(IF_NONE_MATCH, token);
        }

        let response = request.send().await.map_err(|source| Error::SourceUnreachable {
            url: url.to_string(),
            source,
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            trace!(url, "origin reports content not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let new_token = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|source| Error::SourceUnreachable {
                url: url.to_string(),
                source,
            })?
            .to_vec();

        debug!(url, bytes = body.len(), "download complete");
        Ok(FetchOutcome::Fetched {
            body,
            change_token: new_token,
        })
    }
}
