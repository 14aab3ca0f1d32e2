use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::http::{Fetcher, Request};
use crate::worker::{ActivationReport, Handled, InstallReport, ServiceWorker};

/// Events delivered to the interception layer by its host
#[derive(Debug)]
pub enum Event {
  /// A new generation was deployed
  Install {
    respond_to: oneshot::Sender<Result<InstallReport>>,
  },
  /// The installed generation should take over
  Activate {
    respond_to: oneshot::Sender<Result<ActivationReport>>,
  },
  /// The application issued a request
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<Handled>>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install { .. } => EventKind::Install,
      Event::Activate { .. } => EventKind::Activate,
      Event::Fetch { .. } => EventKind::Fetch,
    }
  }
}

/// Posts events to a running [`EventLoop`] and awaits their answers.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
  fn send(&self, event: Event) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Event loop is no longer running"))
  }

  pub async fn install(&self) -> Result<InstallReport> {
    let (respond_to, rx) = oneshot::channel();
    self.send(Event::Install { respond_to })?;
    rx.await
      .map_err(|_| eyre!("Install event dropped without a result"))?
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    let (respond_to, rx) = oneshot::channel();
    self.send(Event::Activate { respond_to })?;
    rx.await
      .map_err(|_| eyre!("Activate event dropped without a result"))?
  }

  pub async fn fetch(&self, request: Request) -> Result<Handled> {
    let (respond_to, rx) = oneshot::channel();
    self.send(Event::Fetch {
      request,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Fetch event dropped without a response"))?
  }
}

/// Routes each event kind to its handler on the worker.
///
/// Install and activate are handled inline, one at a time and in the order
/// they were posted, so an event posted after them sees their effect. Each
/// fetch runs as its own task and never waits on another fetch.
pub struct EventLoop<S: CacheStorage + 'static, F: Fetcher + 'static> {
  worker: Arc<ServiceWorker<S, F>>,
  rx: mpsc::UnboundedReceiver<Event>,
  tx: mpsc::UnboundedSender<Event>,
}

impl<S: CacheStorage + 'static, F: Fetcher + 'static> EventLoop<S, F> {
  pub fn new(worker: ServiceWorker<S, F>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      worker: Arc::new(worker),
      rx,
      tx,
    }
  }

  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Dispatch events until every [`EventSender`] has been dropped.
  pub async fn run(self) {
    let Self { worker, mut rx, tx } = self;
    drop(tx);

    let mut tasks = tokio::task::JoinSet::new();
    while let Some(event) = rx.recv().await {
      debug!("Dispatching {:?} event", event.kind());
      let delivered = match event {
        Event::Install { respond_to } => respond_to.send(worker.install().await).is_ok(),
        Event::Activate { respond_to } => respond_to.send(worker.activate()).is_ok(),
        Event::Fetch {
          request,
          respond_to,
        } => {
          let worker = Arc::clone(&worker);
          tasks.spawn(async move {
            if respond_to.send(worker.handle_fetch(request).await).is_err() {
              debug!("Caller went away before its fetch completed");
            }
          });
          true
        }
      };
      if !delivered {
        debug!("Caller went away before its lifecycle event completed");
      }

      // Reap finished fetches so a long run does not accumulate them
      while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
      }
    }

    while let Some(joined) = tasks.join_next().await {
      log_join(joined);
    }
  }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    warn!("Fetch task panicked: {}", e);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::{Config, DEFAULT_MANIFEST};
  use crate::http::client::mock::MockFetcher;
  use crate::http::Response;
  use crate::worker::manifest::Manifest;
  use crate::worker::Classification;

  fn event_loop(fetcher: &MockFetcher) -> EventLoop<MemoryStorage, MockFetcher> {
    let worker = ServiceWorker::new(
      &Config::default(),
      Arc::new(MemoryStorage::new()),
      Arc::new(fetcher.clone()),
    )
    .unwrap();
    EventLoop::new(worker)
  }

  #[tokio::test]
  async fn test_lifecycle_then_concurrent_fetches() {
    let fetcher = MockFetcher::new();
    let scope = Config::default().scope_url().unwrap();
    for url in Manifest::new(DEFAULT_MANIFEST.iter().copied())
      .resolve(&scope)
      .unwrap()
    {
      fetcher.respond(url.as_str(), Response::new(200, "shell"));
    }
    let image = "https://cdn.test/a.png";
    fetcher.respond(image, Response::new(200, "png"));

    let event_loop = event_loop(&fetcher);
    let sender = event_loop.sender();
    let handle = tokio::spawn(event_loop.run());

    sender.install().await.unwrap();
    sender.activate().await.unwrap();

    let (shell, generic) = tokio::join!(
      sender.fetch(Request::parse_get("http://localhost:8080/index.html").unwrap()),
      sender.fetch(Request::parse_get(image).unwrap()),
    );
    let shell = shell.unwrap();
    let generic = generic.unwrap();
    assert_eq!(shell.classification, Some(Classification::ShellAsset));
    assert_eq!(generic.classification, Some(Classification::Generic));
    assert_eq!(generic.into_response().text(), "png");

    drop(sender);
    handle.await.unwrap();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_lifecycle_events_apply_in_posting_order() {
    let fetcher = MockFetcher::new();
    let scope = Config::default().scope_url().unwrap();
    for url in Manifest::new(DEFAULT_MANIFEST.iter().copied())
      .resolve(&scope)
      .unwrap()
    {
      fetcher.respond(url.as_str(), Response::new(200, "shell"));
    }

    let event_loop = event_loop(&fetcher);
    let sender = event_loop.sender();
    let handle = tokio::spawn(event_loop.run());

    // Posted back to back; activate and the fetch must still see the install
    let (installed, activated, fetched) = tokio::join!(
      sender.install(),
      sender.activate(),
      sender.fetch(Request::parse_get("http://localhost:8080/main.js").unwrap()),
    );

    assert_eq!(installed.unwrap().seeded, DEFAULT_MANIFEST.len());
    assert!(activated.is_ok());
    let fetched = fetched.unwrap();
    assert_eq!(fetched.classification, Some(Classification::ShellAsset));
    assert_eq!(fetched.into_response().text(), "shell");

    drop(sender);
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_install_failure_is_reported_to_sender() {
    let fetcher = MockFetcher::new();
    let event_loop = event_loop(&fetcher);
    let sender = event_loop.sender();
    let handle = tokio::spawn(event_loop.run());

    assert!(sender.install().await.is_err());
    assert!(sender.activate().await.is_err());

    drop(sender);
    handle.await.unwrap();
  }

  #[test]
  fn test_event_kind() {
    let (respond_to, _rx) = oneshot::channel();
    let event = Event::Activate { respond_to };
    assert_eq!(event.kind(), EventKind::Activate);
  }
}
