//! Store generation lifecycle: install seeds, activate prunes and claims.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use super::manifest::Manifest;
use crate::cache::{CacheStorage, RequestIdentity, StoreHandle, StoreNames};
use crate::http::{Fetcher, Request, Response};

/// Meta key naming the shell generation that currently serves requests.
pub const ACTIVE_GENERATION_KEY: &str = "active_generation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed; eligible for activation right away (waiting is skipped)
  Waiting,
  Active,
  /// Replaced by a newer generation, or discarded after a failed install
  Superseded,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Waiting => "waiting",
      LifecycleState::Active => "active",
      LifecycleState::Superseded => "superseded",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(LifecycleState::Installing),
      "waiting" => Some(LifecycleState::Waiting),
      "active" => Some(LifecycleState::Active),
      "superseded" => Some(LifecycleState::Superseded),
      _ => None,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
  /// A manifest asset could not be fetched; nothing was seeded.
  #[error("install failed: could not fetch {asset}: {reason}")]
  InstallFailure { asset: String, reason: String },

  #[error("cannot {action} generation {generation} while it is {state}")]
  InvalidTransition {
    action: &'static str,
    generation: String,
    state: LifecycleState,
  },
}

/// What a successful install did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub store: String,
  /// Number of manifest assets seeded (0 when already active)
  pub seeded: usize,
  pub already_active: bool,
}

/// What a successful activation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub generation: String,
  /// Stale stores removed, in enumeration order
  pub deleted: Vec<String>,
  /// The generation that was in control before, if it differs
  pub replaced: Option<String>,
}

/// Drives one shell generation through its states.
///
/// State lives in the storage meta table so that separate processes sharing
/// a database agree on which generation is in control.
pub struct Lifecycle<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  names: StoreNames,
  manifest: Manifest,
  scope: Url,
}

impl<S: CacheStorage, F: Fetcher> Lifecycle<S, F> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    names: StoreNames,
    manifest: Manifest,
    scope: Url,
  ) -> Self {
    Self {
      storage,
      fetcher,
      names,
      manifest,
      scope,
    }
  }

  pub fn names(&self) -> &StoreNames {
    &self.names
  }

  fn state_key(generation: &str) -> String {
    format!("generation:{}", generation)
  }

  fn state_of(&self, generation: &str) -> Result<Option<LifecycleState>> {
    match self.storage.get_meta(&Self::state_key(generation))? {
      Some(s) => LifecycleState::parse(&s)
        .map(Some)
        .ok_or_else(|| eyre!("Unknown lifecycle state '{}' for {}", s, generation)),
      None => Ok(None),
    }
  }

  fn set_state(&self, generation: &str, state: LifecycleState) -> Result<()> {
    self
      .storage
      .set_meta(&Self::state_key(generation), state.as_str())
  }

  /// State of this generation. A generation never installed is `Installing`.
  pub fn state(&self) -> Result<LifecycleState> {
    Ok(
      self
        .state_of(&self.names.shell)?
        .unwrap_or(LifecycleState::Installing),
    )
  }

  /// Generation currently in control, if any.
  pub fn active_generation(&self) -> Result<Option<String>> {
    self.storage.get_meta(ACTIVE_GENERATION_KEY)
  }

  /// Whether requests should be intercepted by this generation.
  pub fn is_controlling(&self) -> Result<bool> {
    Ok(
      self.state()? == LifecycleState::Active
        && self.active_generation()?.as_deref() == Some(self.names.shell.as_str()),
    )
  }

  /// Fetch every manifest asset and seed the shell store with all of them.
  ///
  /// Any asset that fails to fetch, or answers with a non-success status,
  /// fails the whole install; the shell store is then left absent and the
  /// previously active generation stays in control.
  pub async fn install(&self) -> Result<InstallReport> {
    if self.state()? == LifecycleState::Active {
      info!("Generation {} already active, nothing to install", self.names.shell);
      return Ok(InstallReport {
        store: self.names.shell.clone(),
        seeded: 0,
        already_active: true,
      });
    }

    if self.manifest.is_empty() {
      warn!("Manifest for {} is empty, nothing will work offline", self.names.shell);
    }

    self.set_state(&self.names.shell, LifecycleState::Installing)?;
    info!(
      "Installing {}: precaching {} shell assets",
      self.names.shell,
      self.manifest.len()
    );

    let seeded = match self.fetch_manifest().await {
      Ok(entries) => self.storage.put_all(&self.names.shell, &entries).map(|_| entries.len()),
      Err(e) => Err(e.into()),
    };

    match seeded {
      Ok(count) => {
        self.set_state(&self.names.shell, LifecycleState::Waiting)?;
        info!("Installed {} ({} assets), skipping wait", self.names.shell, count);
        Ok(InstallReport {
          store: self.names.shell.clone(),
          seeded: count,
          already_active: false,
        })
      }
      Err(e) => {
        error!("Install of {} failed: {}", self.names.shell, e);
        self.discard()?;
        Err(e)
      }
    }
  }

  async fn fetch_manifest(&self) -> Result<Vec<(RequestIdentity, Response)>, LifecycleError> {
    let urls = self
      .manifest
      .resolve(&self.scope)
      .map_err(|e| LifecycleError::InstallFailure {
        asset: self.scope.to_string(),
        reason: e.to_string(),
      })?;

    try_join_all(urls.into_iter().map(|url| async move {
      let request = Request::get(url);
      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          Ok((RequestIdentity::from_url(&request.url), response))
        }
        Ok(response) => Err(LifecycleError::InstallFailure {
          asset: request.url.to_string(),
          reason: format!("status {}", response.status),
        }),
        Err(e) => Err(LifecycleError::InstallFailure {
          asset: request.url.to_string(),
          reason: e.to_string(),
        }),
      }
    }))
    .await
  }

  /// Drop a generation whose install failed.
  fn discard(&self) -> Result<()> {
    if self.active_generation()?.as_deref() != Some(self.names.shell.as_str()) {
      self.storage.delete(&self.names.shell)?;
    }
    self.set_state(&self.names.shell, LifecycleState::Superseded)
  }

  /// Prune every store that is not a current generation, then take control.
  ///
  /// Running it again with no new generation deletes nothing.
  pub fn activate(&self) -> Result<ActivationReport> {
    let state = self.state()?;
    if !matches!(state, LifecycleState::Waiting | LifecycleState::Active) {
      return Err(
        LifecycleError::InvalidTransition {
          action: "activate",
          generation: self.names.shell.clone(),
          state,
        }
        .into(),
      );
    }

    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if self.names.is_current(&name) {
        continue;
      }
      info!("Deleting stale store: {}", name);
      if self.storage.delete(&name)? {
        deleted.push(name);
      } else {
        warn!("Store {} vanished before it could be deleted", name);
      }
    }

    let previous = self.active_generation()?;
    let replaced = previous.filter(|p| *p != self.names.shell);
    if let Some(old) = &replaced {
      self.set_state(old, LifecycleState::Superseded)?;
    }

    StoreHandle::open(Arc::clone(&self.storage), &self.names.data)?;
    self
      .storage
      .set_meta(ACTIVE_GENERATION_KEY, &self.names.shell)?;
    self.set_state(&self.names.shell, LifecycleState::Active)?;
    info!("Activated {}, claiming open clients", self.names.shell);

    Ok(ActivationReport {
      generation: self.names.shell.clone(),
      deleted,
      replaced,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::http::client::mock::MockFetcher;

  const SCOPE: &str = "http://localhost:8080/";
  const ASSETS: &[&str] = &["./", "./index.html", "./main.js"];

  fn lifecycle(
    storage: &Arc<MemoryStorage>,
    fetcher: &MockFetcher,
    version: &str,
  ) -> Lifecycle<MemoryStorage, MockFetcher> {
    Lifecycle::new(
      Arc::clone(storage),
      Arc::new(fetcher.clone()),
      StoreNames::new("app", version, "v1"),
      Manifest::new(ASSETS.iter().copied()),
      Url::parse(SCOPE).unwrap(),
    )
  }

  fn serve_shell(fetcher: &MockFetcher) {
    for path in ["", "index.html", "main.js"] {
      fetcher.respond(&format!("{}{}", SCOPE, path), Response::new(200, path));
    }
  }

  #[tokio::test]
  async fn test_install_seeds_every_manifest_asset() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let lc = lifecycle(&storage, &fetcher, "v1");

    let report = lc.install().await.unwrap();

    assert_eq!(report.seeded, ASSETS.len());
    assert_eq!(lc.state().unwrap(), LifecycleState::Waiting);
    for url in Manifest::new(ASSETS.iter().copied())
      .resolve(&Url::parse(SCOPE).unwrap())
      .unwrap()
    {
      let cached = storage
        .get("app-shell-v1", &RequestIdentity::from_url(&url))
        .unwrap()
        .unwrap();
      assert!(cached.response.is_success());
    }
  }

  #[tokio::test]
  async fn test_install_fails_if_any_asset_fails() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    fetcher.fail(&format!("{}main.js", SCOPE));
    let lc = lifecycle(&storage, &fetcher, "v1");

    let err = lc.install().await.unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::InstallFailure { .. })
    ));
    assert_eq!(lc.state().unwrap(), LifecycleState::Superseded);
    assert!(storage.keys().unwrap().is_empty());
    assert!(lc.activate().is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    fetcher.respond(&format!("{}index.html", SCOPE), Response::new(404, ""));
    let lc = lifecycle(&storage, &fetcher, "v1");

    assert!(lc.install().await.is_err());
    assert!(storage.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_generation_in_control() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let v1 = lifecycle(&storage, &fetcher, "v1");
    v1.install().await.unwrap();
    v1.activate().unwrap();

    fetcher.fail(SCOPE);
    let v2 = lifecycle(&storage, &fetcher, "v2");
    assert!(v2.install().await.is_err());

    assert!(v1.is_controlling().unwrap());
    assert!(!v2.is_controlling().unwrap());
    assert_eq!(
      storage.keys().unwrap(),
      vec!["app-data-v1".to_string(), "app-shell-v1".to_string()]
    );
  }

  #[tokio::test]
  async fn test_activate_prunes_stale_generations() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("app-shell-v0").unwrap();
    storage.open("app-data-v0").unwrap();
    storage.open("unrelated").unwrap();
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let lc = lifecycle(&storage, &fetcher, "v1");
    lc.install().await.unwrap();

    let report = lc.activate().unwrap();

    assert_eq!(
      report.deleted,
      vec![
        "app-data-v0".to_string(),
        "app-shell-v0".to_string(),
        "unrelated".to_string()
      ]
    );
    assert_eq!(
      storage.keys().unwrap(),
      vec!["app-data-v1".to_string(), "app-shell-v1".to_string()]
    );
    assert!(lc.is_controlling().unwrap());
  }

  #[tokio::test]
  async fn test_repeated_activation_is_noop() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let lc = lifecycle(&storage, &fetcher, "v1");
    lc.install().await.unwrap();
    lc.activate().unwrap();

    let again = lc.activate().unwrap();

    assert!(again.deleted.is_empty());
    assert_eq!(again.replaced, None);
    assert_eq!(storage.len("app-shell-v1").unwrap(), ASSETS.len());
  }

  #[tokio::test]
  async fn test_new_generation_supersedes_old() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let v1 = lifecycle(&storage, &fetcher, "v1");
    v1.install().await.unwrap();
    v1.activate().unwrap();

    let v2 = lifecycle(&storage, &fetcher, "v2");
    v2.install().await.unwrap();
    let report = v2.activate().unwrap();

    assert_eq!(report.deleted, vec!["app-shell-v1".to_string()]);
    assert_eq!(report.replaced, Some("app-shell-v1".to_string()));
    assert_eq!(v1.state().unwrap(), LifecycleState::Superseded);
    assert!(v2.is_controlling().unwrap());
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let lc = lifecycle(&storage, &MockFetcher::new(), "v1");

    let err = lc.activate().unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::InvalidTransition {
        state: LifecycleState::Installing,
        ..
      })
    ));
  }

  #[tokio::test]
  async fn test_install_when_active_is_noop() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = MockFetcher::new();
    serve_shell(&fetcher);
    let lc = lifecycle(&storage, &fetcher, "v1");
    lc.install().await.unwrap();
    lc.activate().unwrap();
    let calls = fetcher.calls();

    let report = lc.install().await.unwrap();

    assert!(report.already_active);
    assert_eq!(fetcher.calls(), calls);
    assert!(lc.is_controlling().unwrap());
  }
}
