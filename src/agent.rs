//! The offline cache agent: install, activate and fetch handlers.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::host::{WorkerHost, WorkerState};
use crate::http::{CacheRequest, CachedResponse, Method};
use crate::net::NetworkFetcher;
use crate::policy::should_runtime_cache;

/// Result of the install step. Install never fails outright; a failed batch
/// is logged and left to the host to retry with a later registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Every asset was fetched and stored
  Installed { assets: usize },
  /// Nothing was stored
  Failed { reason: String },
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Exact match in the cache, network not touched
  Cache,
  /// Network response, whether or not it was also cached
  Network,
  /// Network failed; cached root document served instead
  Fallback,
}

/// What the fetch interceptor did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Not intercepted; the host handles the request as if no agent existed
  Passthrough,
  Respond {
    response: CachedResponse,
    source: ResponseSource,
  },
  /// Network failed and no fallback document is cached
  Unresolved,
}

impl FetchOutcome {
  pub fn response(&self) -> Option<&CachedResponse> {
    match self {
      FetchOutcome::Respond { response, .. } => Some(response),
      _ => None,
    }
  }

  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      FetchOutcome::Respond { source, .. } => Some(*source),
      _ => None,
    }
  }
}

/// Cache-first agent over injected storage, network and host.
///
/// Each handler is independent; the only shared state is the storage, which
/// several in-flight fetches may read and write at once.
pub struct OfflineAgent<S: CacheStorage, F: NetworkFetcher, H: WorkerHost> {
  storage: Arc<S>,
  network: Arc<F>,
  host: Arc<H>,
  cache_name: String,
  scope: Url,
  precache: Vec<CacheRequest>,
  fallback: CacheRequest,
  runtime_cache_hosts: Vec<String>,
}

impl<S: CacheStorage, F: NetworkFetcher, H: WorkerHost> OfflineAgent<S, F, H> {
  /// Build an agent, resolving every configured URL against the scope.
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<F>, host: Arc<H>) -> Result<Self> {
    config.validate()?;
    let scope = config.scope_url()?;

    let precache = config
      .precache
      .iter()
      .map(|url| CacheRequest::parse(Method::Get, url, &scope))
      .collect::<Result<Vec<_>>>()?;

    let fallback = CacheRequest::parse(Method::Get, &config.fallback, &scope)
      .map_err(|e| eyre!("Invalid fallback document: {}", e))?;

    Ok(Self {
      storage,
      network,
      host,
      cache_name: config.cache_name.clone(),
      scope,
      precache,
      fallback,
      runtime_cache_hosts: config.runtime_cache_hosts.clone(),
    })
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn scope(&self) -> &Url {
    &self.scope
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn host(&self) -> &H {
    &self.host
  }

  /// Install step: skip waiting, then populate the bucket with the asset list.
  ///
  /// The batch is all-or-nothing: a single network failure or non-2xx status
  /// leaves the bucket without any of the assets.
  pub async fn install(&self) -> InstallOutcome {
    self.host.set_state(WorkerState::Installing);
    self.host.skip_waiting();

    let outcome = match self.populate().await {
      Ok(assets) => {
        info!(cache = %self.cache_name, assets, "install cached assets");
        InstallOutcome::Installed { assets }
      }
      Err(e) => {
        error!(cache = %self.cache_name, "install cache failed: {:#}", e);
        InstallOutcome::Failed {
          reason: e.to_string(),
        }
      }
    };

    self.host.set_state(WorkerState::Installed);
    outcome
  }

  async fn populate(&self) -> Result<usize> {
    self.storage.open(&self.cache_name)?;

    let fetched = try_join_all(self.precache.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "{} returned status {}",
          request.url(),
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.clone(), response))
    }))
    .await?;

    self.storage.put_all(&self.cache_name, &fetched)?;
    Ok(fetched.len())
  }

  /// Activate step: delete every bucket not named `cache_name`, then claim
  /// open pages. Returns the deleted bucket names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.host.set_state(WorkerState::Activating);

    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if name != self.cache_name && self.storage.delete(&name)? {
        info!(cache = %name, "deleted stale cache");
        deleted.push(name);
      }
    }

    self.host.claim_clients()?;
    self.host.set_state(WorkerState::Activated);
    Ok(deleted)
  }

  /// Fetch interceptor.
  ///
  /// GET only. Cache hit returns without touching the network. On a miss the
  /// network response is returned as-is; a 200 from an allowed URL is also
  /// written to the bucket unless it arrived through a redirect. When the
  /// network fails the cached fallback document is served, if there is one.
  pub async fn handle_fetch(&self, request: &CacheRequest) -> FetchOutcome {
    if !request.is_get() || !self.host.state().can_intercept_fetch() {
      return FetchOutcome::Passthrough;
    }

    match self.storage.match_request(request) {
      Ok(Some(response)) => {
        debug!(%request, "cache hit");
        return FetchOutcome::Respond {
          response,
          source: ResponseSource::Cache,
        };
      }
      Ok(None) => {}
      Err(e) => warn!(%request, "cache lookup failed, treating as miss: {:#}", e),
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200
          && !response.is_redirected_from(request.url())
          && should_runtime_cache(request.url(), &self.scope, &self.runtime_cache_hosts)
        {
          self.store_runtime(request, &response);
        }
        FetchOutcome::Respond {
          response,
          source: ResponseSource::Network,
        }
      }
      Err(e) => {
        debug!(%request, "network failed: {:#}", e);
        self.fallback()
      }
    }
  }

  /// Write failures are dropped; the page still gets the network response.
  fn store_runtime(&self, request: &CacheRequest, response: &CachedResponse) {
    match self.storage.put(&self.cache_name, request, response) {
      Ok(()) => debug!(%request, "runtime cached"),
      Err(e) => debug!(%request, "runtime cache write ignored: {:#}", e),
    }
  }

  fn fallback(&self) -> FetchOutcome {
    match self.storage.match_request(&self.fallback) {
      Ok(Some(response)) => FetchOutcome::Respond {
        response,
        source: ResponseSource::Fallback,
      },
      Ok(None) => FetchOutcome::Unresolved,
      Err(e) => {
        warn!("fallback lookup failed: {:#}", e);
        FetchOutcome::Unresolved
      }
    }
  }
}

impl<S: CacheStorage, F: NetworkFetcher, H: WorkerHost> Clone for OfflineAgent<S, F, H> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      host: Arc::clone(&self.host),
      cache_name: self.cache_name.clone(),
      scope: self.scope.clone(),
      precache: self.precache.clone(),
      fallback: self.fallback.clone(),
      runtime_cache_hosts: self.runtime_cache_hosts.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{EntrySummary, NoopStorage, SqliteStorage};
  use crate::host::LocalHost;
  use crate::net::FetchFuture;
  use std::collections::HashMap;
  use std::sync::Mutex;

  /// Network fake: answers from a fixed table, fails for anything else.
  #[derive(Default)]
  struct ScriptedNetwork {
    responses: Mutex<HashMap<String, u16>>,
    redirects: Mutex<HashMap<String, String>>,
    offline: Mutex<bool>,
    calls: Mutex<Vec<String>>,
  }

  impl ScriptedNetwork {
    fn respond(self, url: &str, status: u16) -> Self {
      self
        .responses
        .lock()
        .unwrap()
        .insert(url.to_string(), status);
      self
    }

    fn redirect(self, from: &str, to: &str) -> Self {
      self
        .redirects
        .lock()
        .unwrap()
        .insert(from.to_string(), to.to_string());
      self
    }

    fn go_offline(&self) {
      *self.offline.lock().unwrap() = true;
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl NetworkFetcher for ScriptedNetwork {
    fn fetch<'a>(&'a self, request: &'a CacheRequest) -> FetchFuture<'a> {
      Box::pin(async move {
        let url = request.url().to_string();
        self.calls.lock().unwrap().push(url.clone());

        if *self.offline.lock().unwrap() {
          return Err(eyre!("offline"));
        }
        let url = self
          .redirects
          .lock()
          .unwrap()
          .get(&url)
          .cloned()
          .unwrap_or(url);
        let status = self.responses.lock().unwrap().get(&url).copied();
        match status {
          Some(status) => Ok(
            CachedResponse::new(url.clone(), status, format!("body of {}", url))
              .with_header("content-type", "text/plain"),
          ),
          None => Err(eyre!("connection refused")),
        }
      })
    }
  }

  /// Storage whose reads and writes all fail.
  struct FailingStorage;

  impl CacheStorage for FailingStorage {
    fn open(&self, _name: &str) -> Result<()> {
      Ok(())
    }

    fn has(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }

    fn keys(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }

    fn delete(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }

    fn match_request(&self, _request: &CacheRequest) -> Result<Option<CachedResponse>> {
      Err(eyre!("database is locked"))
    }

    fn match_in(&self, _bucket: &str, _request: &CacheRequest) -> Result<Option<CachedResponse>> {
      Err(eyre!("database is locked"))
    }

    fn put(&self, _bucket: &str, _request: &CacheRequest, _response: &CachedResponse) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn put_all(&self, _bucket: &str, _entries: &[(CacheRequest, CachedResponse)]) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn entries(&self, _bucket: &str) -> Result<Vec<EntrySummary>> {
      Ok(Vec::new())
    }
  }

  fn failing_agent(
    network: ScriptedNetwork,
  ) -> OfflineAgent<FailingStorage, ScriptedNetwork, LocalHost> {
    OfflineAgent::new(
      &Config::default(),
      Arc::new(FailingStorage),
      Arc::new(network),
      Arc::new(LocalHost::activated()),
    )
    .unwrap()
  }

  const SCOPE: &str = "http://localhost:8080/";

  fn all_assets_online() -> ScriptedNetwork {
    let config = Config::default();
    let scope = config.scope_url().unwrap();
    config.precache.iter().fold(ScriptedNetwork::default(), |net, asset| {
      let url = scope.join(asset).unwrap();
      net.respond(url.as_str(), 200)
    })
  }

  type TestAgent = OfflineAgent<SqliteStorage, ScriptedNetwork, LocalHost>;

  fn agent_with(network: ScriptedNetwork, host: LocalHost) -> TestAgent {
    OfflineAgent::new(
      &Config::default(),
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(network),
      Arc::new(host),
    )
    .unwrap()
  }

  fn get(url: &str) -> CacheRequest {
    CacheRequest::parse(Method::Get, url, &Url::parse(SCOPE).unwrap()).unwrap()
  }

  async fn installed_agent() -> TestAgent {
    let agent = agent_with(all_assets_online(), LocalHost::new());
    assert_eq!(
      agent.install().await,
      InstallOutcome::Installed { assets: 12 }
    );
    agent.activate().await.unwrap();
    agent
  }

  #[tokio::test]
  async fn test_install_populates_bucket_and_skips_waiting() {
    let agent = agent_with(all_assets_online(), LocalHost::new());

    let outcome = agent.install().await;

    assert_eq!(outcome, InstallOutcome::Installed { assets: 12 });
    assert!(agent.host().skip_waiting_requested());
    assert_eq!(agent.host().state(), WorkerState::Installed);
    assert_eq!(agent.storage().entries("sgpc-cash-v24").unwrap().len(), 12);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    // The babel bundle is missing from the table, so its fetch fails
    let network = all_assets_online();
    network
      .responses
      .lock()
      .unwrap()
      .remove("https://unpkg.com/@babel/standalone/babel.min.js");
    let agent = agent_with(network, LocalHost::new());

    let outcome = agent.install().await;

    assert!(matches!(outcome, InstallOutcome::Failed { .. }));
    assert!(agent.storage().entries("sgpc-cash-v24").unwrap().is_empty());
    assert_eq!(agent.host().state(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_install_fails_on_error_status() {
    let network = all_assets_online().respond("http://localhost:8080/developer.jpg", 404);
    let agent = agent_with(network, LocalHost::new());

    match agent.install().await {
      InstallOutcome::Failed { reason } => assert!(reason.contains("404")),
      other => panic!("expected failure, got {:?}", other),
    }
    assert!(agent.storage().entries("sgpc-cash-v24").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_deletes_other_buckets() {
    let agent = agent_with(ScriptedNetwork::default(), LocalHost::new());
    agent.storage().open("sgpc-cash-v23").unwrap();
    agent.storage().open("sgpc-cash-v24").unwrap();

    let deleted = agent.activate().await.unwrap();

    assert_eq!(deleted, vec!["sgpc-cash-v23".to_string()]);
    assert_eq!(agent.storage().keys().unwrap(), vec!["sgpc-cash-v24"]);
    assert!(agent.host().clients_claimed());
    assert_eq!(agent.host().state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_activate_without_current_bucket_leaves_none() {
    let agent = agent_with(ScriptedNetwork::default(), LocalHost::new());
    agent.storage().open("other-app").unwrap();
    agent.storage().open("sgpc-cash-v1").unwrap();

    let deleted = agent.activate().await.unwrap();

    assert_eq!(deleted.len(), 2);
    assert!(agent.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_precached_asset_served_without_network() {
    let agent = installed_agent().await;
    let before = agent.network.calls().len();

    let outcome = agent.handle_fetch(&get("./index.html")).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    assert_eq!(
      outcome.response().unwrap().body,
      b"body of http://localhost:8080/index.html"
    );
    assert_eq!(agent.network.calls().len(), before);
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let agent = installed_agent().await;
    let before = agent.network.calls().len();
    let url = Url::parse("http://localhost:8080/index.html").unwrap();

    for method in [Method::Post, Method::Put, Method::Delete, Method::Head] {
      let outcome = agent
        .handle_fetch(&CacheRequest::new(method, url.clone()))
        .await;
      assert_eq!(outcome, FetchOutcome::Passthrough);
    }
    assert_eq!(agent.network.calls().len(), before);
  }

  #[tokio::test]
  async fn test_not_intercepted_before_activation() {
    let agent = agent_with(all_assets_online(), LocalHost::new());
    agent.install().await;

    let outcome = agent.handle_fetch(&get("./index.html")).await;
    assert_eq!(outcome, FetchOutcome::Passthrough);
  }

  #[tokio::test]
  async fn test_allowed_cdn_response_is_cached() {
    let url = "https://unpkg.com/react@18/umd/react.production.min.js";
    let agent = agent_with(
      ScriptedNetwork::default().respond(url, 200),
      LocalHost::activated(),
    );

    let outcome = agent.handle_fetch(&get(url)).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert_eq!(outcome.response().unwrap().body, format!("body of {}", url).as_bytes());
    let stored = agent
      .storage()
      .match_in("sgpc-cash-v24", &get(url))
      .unwrap()
      .unwrap();
    assert_eq!(stored.body, outcome.response().unwrap().body);

    // Second request is a cache hit
    let again = agent.handle_fetch(&get(url)).await;
    assert_eq!(again.source(), Some(ResponseSource::Cache));
    assert_eq!(agent.network.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_same_origin_response_is_cached() {
    let url = "http://localhost:8080/data/hukamnama.json";
    let agent = agent_with(
      ScriptedNetwork::default().respond(url, 200),
      LocalHost::activated(),
    );

    agent.handle_fetch(&get(url)).await;

    assert!(agent.storage().match_request(&get(url)).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_disallowed_third_party_not_cached() {
    let url = "https://api.example.com/data.json";
    let agent = agent_with(
      ScriptedNetwork::default().respond(url, 200),
      LocalHost::activated(),
    );

    let outcome = agent.handle_fetch(&get(url)).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert_eq!(outcome.response().unwrap().status, 200);
    assert!(agent.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_redirected_response_returned_but_not_cached() {
    let old = "http://localhost:8080/old";
    let new = "http://localhost:8080/new";
    let agent = agent_with(
      ScriptedNetwork::default()
        .redirect(old, new)
        .respond(new, 200),
      LocalHost::activated(),
    );

    let outcome = agent.handle_fetch(&get(old)).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    let response = outcome.response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.url, new);
    assert!(agent.storage().match_request(&get(old)).unwrap().is_none());
    assert!(agent.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_follows_redirects() {
    let network = all_assets_online()
      .redirect("http://localhost:8080/developer.jpg", "http://localhost:8080/img/dev.jpg")
      .respond("http://localhost:8080/img/dev.jpg", 200);
    let agent = agent_with(network, LocalHost::new());

    assert_eq!(
      agent.install().await,
      InstallOutcome::Installed { assets: 12 }
    );
    let stored = agent
      .storage()
      .match_request(&get("./developer.jpg"))
      .unwrap()
      .unwrap();
    assert_eq!(stored.url, "http://localhost:8080/img/dev.jpg");
  }

  #[tokio::test]
  async fn test_runtime_write_failure_still_returns_response() {
    let url = "https://unpkg.com/react@18/umd/react.development.js";
    let agent = failing_agent(ScriptedNetwork::default().respond(url, 200));

    let outcome = agent.handle_fetch(&get(url)).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert_eq!(
      outcome.response().unwrap().body,
      format!("body of {}", url).as_bytes()
    );
    assert_eq!(agent.network.calls(), vec![url.to_string()]);
  }

  #[tokio::test]
  async fn test_lookup_failure_treated_as_miss() {
    let agent = failing_agent(ScriptedNetwork::default());
    agent.network.go_offline();

    let outcome = agent.handle_fetch(&get("./index.html")).await;

    assert_eq!(outcome, FetchOutcome::Unresolved);
    // Lookup error did not short-circuit: the network was still tried
    assert_eq!(agent.network.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_non_200_returned_but_not_cached() {
    let missing = "http://localhost:8080/missing.png";
    let created = "http://localhost:8080/created";
    let agent = agent_with(
      ScriptedNetwork::default()
        .respond(missing, 404)
        .respond(created, 201),
      LocalHost::activated(),
    );

    let outcome = agent.handle_fetch(&get(missing)).await;
    assert_eq!(outcome.response().unwrap().status, 404);

    let outcome = agent.handle_fetch(&get(created)).await;
    assert_eq!(outcome.response().unwrap().status, 201);

    assert!(agent.storage().match_request(&get(missing)).unwrap().is_none());
    assert!(agent.storage().match_request(&get(created)).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_miss_serves_fallback_document() {
    let agent = installed_agent().await;
    agent.network.go_offline();

    let outcome = agent.handle_fetch(&get("./some/spa/route")).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Fallback));
    let index = agent
      .storage()
      .match_request(&get("./index.html"))
      .unwrap()
      .unwrap();
    assert_eq!(outcome.response(), Some(&index));
  }

  #[tokio::test]
  async fn test_offline_cross_origin_miss_also_falls_back() {
    let agent = installed_agent().await;
    agent.network.go_offline();

    let outcome = agent
      .handle_fetch(&get("https://api.example.com/data.json"))
      .await;

    assert_eq!(outcome.source(), Some(ResponseSource::Fallback));
  }

  #[tokio::test]
  async fn test_offline_without_fallback_is_unresolved() {
    let agent = agent_with(ScriptedNetwork::default(), LocalHost::activated());
    agent.network.go_offline();

    let outcome = agent.handle_fetch(&get("./index.html")).await;

    assert_eq!(outcome, FetchOutcome::Unresolved);
    assert!(outcome.response().is_none());
  }

  #[tokio::test]
  async fn test_noop_storage_always_goes_to_network() {
    let url = "http://localhost:8080/index.html";
    let agent = OfflineAgent::new(
      &Config::default(),
      Arc::new(NoopStorage),
      Arc::new(ScriptedNetwork::default().respond(url, 200)),
      Arc::new(LocalHost::activated()),
    )
    .unwrap();

    agent.handle_fetch(&get(url)).await;
    let outcome = agent.handle_fetch(&get(url)).await;

    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert_eq!(agent.network.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_bucket() {
    let urls = [
      "https://unpkg.com/a.js",
      "https://unpkg.com/b.js",
      "https://cdnjs.cloudflare.com/c.js",
    ];
    let network = urls
      .iter()
      .fold(ScriptedNetwork::default(), |net, url| net.respond(url, 200));
    let agent = agent_with(network, LocalHost::activated());

    let requests: Vec<_> = urls.iter().map(|u| get(u)).collect();
    let outcomes =
      futures::future::join_all(requests.iter().map(|r| agent.handle_fetch(r))).await;

    assert!(outcomes
      .iter()
      .all(|o| o.source() == Some(ResponseSource::Network)));
    assert_eq!(agent.storage().entries("sgpc-cash-v24").unwrap().len(), 3);
  }

  #[test]
  fn test_invalid_fallback_rejected() {
    let config = Config {
      fallback: "http://[::1".to_string(),
      ..Config::default()
    };
    let result = OfflineAgent::new(
      &config,
      Arc::new(NoopStorage),
      Arc::new(ScriptedNetwork::default()),
      Arc::new(LocalHost::new()),
    );
    assert!(result.is_err());
  }
}
