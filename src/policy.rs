//! Which network responses get written to the cache at runtime.

use url::Url;

/// Whether a successful response for `request_url` should be cached at runtime.
///
/// A URL qualifies when its serialization starts with the worker's origin, or
/// when it contains any of `hosts` anywhere in the string. The host check is a
/// plain substring test, so `https://evil.example/?unpkg.com` qualifies too.
pub fn should_runtime_cache(request_url: &Url, scope: &Url, hosts: &[String]) -> bool {
  let url = request_url.as_str();
  let origin = scope.origin().ascii_serialization();

  url.starts_with(&origin) || hosts.iter().any(|h| url.contains(h.as_str()))
}
