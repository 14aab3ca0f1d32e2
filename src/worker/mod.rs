//! The interception layer: classification, serving strategies and the store
//! generation lifecycle, wired together behind one facade.

pub mod lifecycle;
pub mod manifest;
pub mod payload;
pub mod strategy;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, StoreHandle, StoreNames};
use crate::config::Config;
use crate::http::{Fetcher, Request, Response};

use lifecycle::Lifecycle;
use strategy::StrategyEngine;

pub use lifecycle::{ActivationReport, InstallReport, LifecycleState};
pub use manifest::{Classification, Classifier};
pub use strategy::Outcome;

/// How one request was handled.
#[derive(Debug, Clone)]
pub struct Handled {
  /// `None` when the request was not intercepted
  pub classification: Option<Classification>,
  pub outcome: Outcome,
}

impl Handled {
  pub fn into_response(self) -> Response {
    self.outcome.into_response()
  }
}

/// One deployed generation of the interception layer.
pub struct ServiceWorker<S: CacheStorage, F: Fetcher> {
  classifier: Classifier,
  engine: StrategyEngine<S, F>,
  lifecycle: Lifecycle<S, F>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> ServiceWorker<S, F> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    let names = StoreNames::new(&config.cache_prefix, &config.version, &config.data_version);
    let classifier = Classifier::from_config(config);

    let engine = StrategyEngine::new(
      StoreHandle::unopened(Arc::clone(&storage), &names.shell),
      StoreHandle::unopened(Arc::clone(&storage), &names.data),
      Arc::clone(&fetcher),
      payload::fallback_response()?,
    );

    let lifecycle = Lifecycle::new(
      storage,
      Arc::clone(&fetcher),
      names,
      classifier.manifest().clone(),
      config.scope_url()?,
    );

    Ok(Self {
      classifier,
      engine,
      lifecycle,
      fetcher,
    })
  }

  pub fn names(&self) -> &StoreNames {
    self.lifecycle.names()
  }

  pub fn state(&self) -> Result<LifecycleState> {
    self.lifecycle.state()
  }

  pub async fn install(&self) -> Result<InstallReport> {
    self.lifecycle.install().await
  }

  pub fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate()
  }

  /// Produce the response for one outgoing request.
  ///
  /// Until this generation has been activated the request is not
  /// intercepted and goes straight to the network; a transport failure is
  /// then returned as an error for the host to report.
  pub async fn handle_fetch(&self, request: Request) -> Result<Handled> {
    if !self.lifecycle.is_controlling()? {
      debug!("Not in control, passing through: {}", request.url);
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Network request to {} failed: {}", request.url, e))?;
      return Ok(Handled {
        classification: None,
        outcome: Outcome::Success(response),
      });
    }

    let classification = self.classifier.classify(&request.url);
    info!("{} {} -> {}", request.method, request.url, classification);

    let outcome = self.engine.execute(classification, &request).await;
    Ok(Handled {
      classification: Some(classification),
      outcome,
    })
  }
}
