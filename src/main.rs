mod cache;
mod config;
mod event;
mod http;
mod logging;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::event::EventLoop;
use crate::http::{HttpClient, Method, Request};
use crate::worker::payload::is_fallback;
use crate::worker::strategy::ServedFrom;
use crate::worker::{Classifier, Handled, Outcome, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline-first request interception with a versioned app-shell cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL the manifest resolves against
  #[arg(short, long)]
  scope: Option<String>,

  /// Keep stores in memory for this run only
  #[arg(long)]
  in_memory: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell for the configured version
  Install,
  /// Delete stale stores and take control of requests
  Activate,
  /// Install, then activate
  Update,
  /// Send requests through the interception layer
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,

    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Print response bodies
    #[arg(long)]
    body: bool,

    /// Install and activate before fetching
    #[arg(long)]
    update: bool,
  },
  /// List stores and their entry counts
  Stores,
  /// Show how URLs are classified
  Classify {
    #[arg(required = true)]
    urls: Vec<String>,
  },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override from the command line
  if let Some(scope) = args.scope {
    config.scope = scope;
  }
  if args.in_memory {
    config.storage.in_memory = true;
  }

  let _log_guard = logging::init(&config.log)?;

  if config.storage.in_memory {
    run(&config, Arc::new(MemoryStorage::new()), args.command).await
  } else {
    let path = match &config.storage.path {
      Some(p) => p.clone(),
      None => SqliteStorage::default_path()?,
    };
    run(&config, Arc::new(SqliteStorage::open_at(&path)?), args.command).await
  }
}

async fn run<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Classify { urls } => {
      let classifier = Classifier::from_config(config);
      for url in urls {
        let request = Request::parse_get(&url)?;
        println!("{:<14} {}", classifier.classify(&request.url), url);
      }
      return Ok(());
    }
    Command::Stores => {
      let fetcher = Arc::new(HttpClient::new(&config.network)?);
      let worker = ServiceWorker::new(config, Arc::clone(&storage), fetcher)?;
      let names = worker.names();
      println!("generation {} is {}", names.shell, worker.state()?);
      for name in storage.keys()? {
        let marker = if names.is_current(&name) { "*" } else { " " };
        println!("{} {:<40} {:>6} entries", marker, name, storage.len(&name)?);
      }
      return Ok(());
    }
    _ => {}
  }

  let fetcher = Arc::new(HttpClient::new(&config.network)?);
  let worker = ServiceWorker::new(config, storage, fetcher)?;
  let event_loop = EventLoop::new(worker);
  let sender = event_loop.sender();
  let handle = tokio::spawn(event_loop.run());

  let result = async {
    let update = matches!(command, Command::Update | Command::Fetch { update: true, .. });

    if update || matches!(command, Command::Install) {
      let report = sender.install().await?;
      if report.already_active {
        println!("{} is already active", report.store);
      } else {
        println!("installed {} ({} assets)", report.store, report.seeded);
      }
    }

    if update || matches!(command, Command::Activate) {
      let report = sender.activate().await?;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      println!("activated {}", report.generation);
    }

    if let Command::Fetch {
      urls, method, body, ..
    } = command
    {
      let method = Method::parse(&method);
      let requests = urls
        .iter()
        .map(|url| {
          Request::parse_get(url).map(|r| Request {
            method: method.clone(),
            ..r
          })
        })
        .collect::<Result<Vec<_>>>()?;

      let results = join_all(requests.into_iter().map(|r| sender.fetch(r))).await;
      for (url, result) in urls.iter().zip(results) {
        match result {
          Ok(handled) => print_handled(url, handled, body),
          Err(e) => eprintln!("ERR {}: {}", url, e),
        }
      }
    }

    Ok::<_, color_eyre::Report>(())
  }
  .await;

  drop(sender);
  handle.await?;
  result
}

fn print_handled(url: &str, handled: Handled, show_body: bool) {
  let route = handled
    .classification
    .map(|c| c.to_string())
    .unwrap_or_else(|| "passthrough".to_string());

  let note = match &handled.outcome {
    Outcome::Degraded {
      reason,
      served_from,
      ..
    } => {
      let source = match served_from {
        ServedFrom::Store => "stored answer",
        ServedFrom::Fallback => "fallback",
      };
      format!(" (degraded: {}, served {})", reason, source)
    }
    Outcome::Fatal(e) => format!(" ({})", e),
    Outcome::Success(_) => String::new(),
  };

  let response = handled.into_response();
  let marker = if is_fallback(&response) { " [offline placeholder]" } else { "" };
  println!("{} {:<14} {}{}{}", response.status, route, url, note, marker);
  if show_body {
    if let Some(content_type) = response.header("content-type") {
      println!("content-type: {}", content_type);
    }
    println!("{}", response.text());
  }
}
