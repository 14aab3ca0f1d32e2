//! Serving strategies, one per request classification.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::manifest::Classification;
use crate::cache::{CacheStorage, CachedResponse, RequestIdentity, StoreHandle};
use crate::http::{Fetcher, Method, Request, Response};

const ASSET_MISSING_BODY: &str = "App shell file not found in cache";
const UNAVAILABLE_BODY: &str = "Resource not available offline.";

/// Failures that reach the caller as a synthetic status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
  /// A shell asset is absent from the shell store. Install seeds every shell
  /// asset, so this points at a packaging problem.
  #[error("shell asset missing from store: {0}")]
  AssetMissing(RequestIdentity),

  /// Not cached and the network could not be reached.
  #[error("{identity} unavailable: {reason}")]
  GenericUnavailable {
    identity: RequestIdentity,
    reason: String,
  },
}

impl StrategyError {
  pub fn to_response(&self) -> Response {
    match self {
      StrategyError::AssetMissing(_) => Response::plain_text(404, ASSET_MISSING_BODY),
      StrategyError::GenericUnavailable { .. } => Response::plain_text(503, UNAVAILABLE_BODY),
    }
  }
}

/// Why the data endpoint could not be answered live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
  UpstreamStatus(u16),
  NetworkFailure(String),
}

impl fmt::Display for DegradeReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DegradeReason::UpstreamStatus(status) => write!(f, "upstream returned {}", status),
      DegradeReason::NetworkFailure(e) => write!(f, "network failure: {}", e),
    }
  }
}

/// Where a degraded answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Last stored response for the same request identity
  Store,
  /// The static placeholder document
  Fallback,
}

/// Result of running a strategy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Success(Response),
  Degraded {
    response: Response,
    reason: DegradeReason,
    served_from: ServedFrom,
  },
  Fatal(StrategyError),
}

impl Outcome {
  /// Collapse the outcome into what the caller receives.
  pub fn into_response(self) -> Response {
    match self {
      Outcome::Success(response) => response,
      Outcome::Degraded { response, .. } => response,
      Outcome::Fatal(err) => err.to_response(),
    }
  }
}

/// Runs the serving strategies against the current stores and the network.
pub struct StrategyEngine<S: CacheStorage, F: Fetcher> {
  shell: StoreHandle<S>,
  data: StoreHandle<S>,
  fetcher: Arc<F>,
  fallback: Response,
}

impl<S: CacheStorage, F: Fetcher> StrategyEngine<S, F> {
  /// Generic resources share the shell store; only the data endpoint has
  /// its own.
  pub fn new(
    shell: StoreHandle<S>,
    data: StoreHandle<S>,
    fetcher: Arc<F>,
    fallback: Response,
  ) -> Self {
    Self {
      shell,
      data,
      fetcher,
      fallback,
    }
  }

  pub async fn execute(&self, classification: Classification, request: &Request) -> Outcome {
    match classification {
      Classification::ShellAsset => self.store_only(request),
      Classification::DataEndpoint => self.network_first(request).await,
      Classification::Generic => self.cache_first(request).await,
    }
  }

  /// Shell assets: answer from the shell store, never from the network.
  pub fn store_only(&self, request: &Request) -> Outcome {
    let identity = RequestIdentity::from_url(&request.url);

    match lookup(&self.shell, &identity) {
      Some(cached) => {
        debug!("Shell asset from store: {}", request.url.path());
        Outcome::Success(cached.response)
      }
      None => {
        warn!("Shell asset missing from {}: {}", self.shell.name(), identity);
        Outcome::Fatal(StrategyError::AssetMissing(identity))
      }
    }
  }

  /// Data endpoint: live response when possible, then the stored answer for
  /// the same query, then the placeholder. Always status 200 when degraded.
  pub async fn network_first(&self, request: &Request) -> Outcome {
    let identity = RequestIdentity::from_url(&request.url);

    let reason = match self.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => {
        store_copy(&self.data, &identity, request, &response);
        info!("Data endpoint answered live: {}", identity);
        return Outcome::Success(response);
      }
      Ok(response) => DegradeReason::UpstreamStatus(response.status),
      Err(e) => DegradeReason::NetworkFailure(e.to_string()),
    };

    match lookup(&self.data, &identity) {
      Some(cached) => {
        warn!(
          "Data endpoint degraded ({}), serving answer stored at {}: {}",
          reason,
          cached.cached_at.format("%Y-%m-%d %H:%M:%S"),
          identity
        );
        Outcome::Degraded {
          response: cached.response,
          reason,
          served_from: ServedFrom::Store,
        }
      }
      None => {
        warn!("Data endpoint degraded ({}), serving fallback: {}", reason, identity);
        Outcome::Degraded {
          response: self.fallback.clone(),
          reason,
          served_from: ServedFrom::Fallback,
        }
      }
    }
  }

  /// Everything else: stored copy if there is one, otherwise the network.
  /// A non-success status passes through untouched.
  pub async fn cache_first(&self, request: &Request) -> Outcome {
    let identity = RequestIdentity::from_url(&request.url);

    if let Some(cached) = lookup(&self.shell, &identity) {
      debug!("Resource from store: {}", identity);
      return Outcome::Success(cached.response);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store_copy(&self.shell, &identity, request, &response);
        }
        Outcome::Success(response)
      }
      Err(e) => {
        warn!("No network and nothing stored for {}: {}", identity, e);
        Outcome::Fatal(StrategyError::GenericUnavailable {
          identity,
          reason: e.to_string(),
        })
      }
    }
  }
}

/// Store reads never fail a request; an unreadable entry is a miss.
fn lookup<S: CacheStorage>(
  store: &StoreHandle<S>,
  identity: &RequestIdentity,
) -> Option<CachedResponse> {
  match store.get(identity) {
    Ok(cached) => cached,
    Err(e) => {
      warn!("Failed to read {} from {}: {}", identity, store.name(), e);
      None
    }
  }
}

/// Keep a copy of a successful response. Failure is logged and otherwise
/// ignored; the caller still gets the live response.
fn store_copy<S: CacheStorage>(
  store: &StoreHandle<S>,
  identity: &RequestIdentity,
  request: &Request,
  response: &Response,
) {
  if request.method != Method::Get {
    debug!("Not storing {} response for {}", request.method, identity);
    return;
  }

  match store.put(identity, response) {
    Ok(()) => debug!("Stored in {}: {}", store.name(), identity),
    Err(e) => warn!("Failed to store {} in {}: {}", identity, store.name(), e),
  }
}
