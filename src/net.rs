//! Network side of the fetch interceptor.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use crate::http::{CacheRequest, CachedResponse};

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<CachedResponse>> + Send + 'a>>;

/// Issues requests on behalf of the agent.
///
/// `Err` means the request never produced a response (offline, DNS, TLS,
/// connection reset). Any HTTP status, including 4xx/5xx, is an `Ok` response.
pub trait NetworkFetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a CacheRequest) -> FetchFuture<'a>;
}

/// Fetcher backed by a reqwest client.
///
/// No timeout is configured; a hung request waits on the client defaults.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("sgpc-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: &CacheRequest) -> Result<CachedResponse> {
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method(), e))?;

    let response = self
      .client
      .request(method, request.url().clone())
      .send()
      .await
      .map_err(|e| eyre!("Network request {} failed: {}", request, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request, e))?;

    debug!(%request, status = status.as_u16(), bytes = body.len(), "network response");

    Ok(CachedResponse {
      url,
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
      cached_at: None,
    })
  }
}

impl NetworkFetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a CacheRequest) -> FetchFuture<'a> {
    Box::pin(self.send(request))
  }
}
