//! Request and response values passed between the agent, the cache and the network.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
  Other(String),
}

impl Method {
  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
      Method::Other(m) => m,
    }
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    let upper = s.trim().to_uppercase();
    match upper.as_str() {
      "" => Err(eyre!("Empty request method")),
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      _ => Ok(Method::Other(upper)),
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An outgoing request as seen by the fetch interceptor.
///
/// The URL never carries a fragment: the cache matches on method + URL and
/// ignores `#...`, so it is stripped on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
  method: Method,
  url: Url,
}

impl CacheRequest {
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Parse an absolute URL, or resolve a relative one against `base`.
  pub fn parse(method: Method, url: &str, base: &Url) -> Result<Self> {
    let url = base
      .join(url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  /// Stable, fixed-length storage key for this request identity.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.url);
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response body with its status line and headers.
///
/// Cloning duplicates the body, so the copy handed to the cache and the one
/// returned to the page are independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  /// Final URL the response came from
  pub url: String,
  pub status: u16,
  pub status_text: String,
  /// Headers in the order received
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the response was written to the cache (None for network responses)
  #[serde(default)]
  pub cached_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.into(),
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
      cached_at: None,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Status in the 200-299 range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether the final URL differs from the one requested, i.e. the response
  /// arrived through one or more redirects.
  pub fn is_redirected_from(&self, requested: &Url) -> bool {
    self.url != requested.as_str()
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
