//! App shell manifest and request classification.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use url::Url;

use crate::config::{Config, DataEndpointConfig};

/// Document served for a bare directory request.
pub const INDEX_DOCUMENT: &str = "index.html";

/// Ordered list of relative paths that make up the app shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  entries: Vec<String>,
}

impl Manifest {
  pub fn new<I, S>(entries: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      entries: entries.into_iter().map(Into::into).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Resolve every entry against the scope, keeping manifest order.
  pub fn resolve(&self, scope: &Url) -> Result<Vec<Url>> {
    self
      .entries
      .iter()
      .map(|entry| {
        scope
          .join(entry)
          .map_err(|e| eyre!("Failed to resolve manifest entry '{}': {}", entry, e))
      })
      .collect()
  }

  /// First entry matching the path, if any.
  pub fn matching_entry(&self, path: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|entry| entry_matches(path, entry))
      .map(String::as_str)
  }
}

/// Whether a request path names a shell asset.
///
/// Entries compare as path suffixes on a segment boundary, so `main.js`
/// matches `/main.js` and `/app/main.js` but not `/domain.js`. The root entry
/// (`./`, `/` or empty) matches the bare root path and the index document.
pub fn is_shell_asset(path: &str, manifest: &Manifest) -> bool {
  manifest.matching_entry(path).is_some()
}

fn normalize(entry: &str) -> &str {
  let entry = entry.trim();
  let entry = entry.strip_prefix("./").unwrap_or(entry);
  let entry = entry.trim_start_matches('/');
  if entry == "." {
    ""
  } else {
    entry
  }
}

fn entry_matches(path: &str, entry: &str) -> bool {
  let entry = normalize(entry);
  if entry.is_empty() {
    return path == "/" || path_ends_with_segment(path, INDEX_DOCUMENT);
  }
  path_ends_with_segment(path, entry)
}

fn path_ends_with_segment(path: &str, suffix: &str) -> bool {
  match path.strip_suffix(suffix) {
    Some(rest) => rest.is_empty() || rest.ends_with('/'),
    None => false,
  }
}

/// The single remote search resource cached in the data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEndpoint {
  host: String,
  path: String,
}

impl DataEndpoint {
  pub fn new(host: &str, path: &str) -> Self {
    Self {
      host: host.to_ascii_lowercase(),
      path: path.to_string(),
    }
  }

  /// Exact host and exact path. The query string is ignored here; it only
  /// distinguishes entries within the store.
  pub fn matches(&self, url: &Url) -> bool {
    url.host_str() == Some(self.host.as_str()) && url.path() == self.path
  }
}

impl From<&DataEndpointConfig> for DataEndpoint {
  fn from(config: &DataEndpointConfig) -> Self {
    Self::new(&config.host, &config.path)
  }
}

/// Category a request falls into, which selects its serving strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  ShellAsset,
  DataEndpoint,
  Generic,
}

impl fmt::Display for Classification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Classification::ShellAsset => "shell-asset",
      Classification::DataEndpoint => "data-endpoint",
      Classification::Generic => "generic",
    };
    f.write_str(name)
  }
}

/// Maps a request locator to its [`Classification`].
#[derive(Debug, Clone)]
pub struct Classifier {
  manifest: Manifest,
  endpoint: DataEndpoint,
}

impl Classifier {
  pub fn new(manifest: Manifest, endpoint: DataEndpoint) -> Self {
    Self { manifest, endpoint }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(
      Manifest::new(config.manifest.iter().cloned()),
      DataEndpoint::from(&config.data_endpoint),
    )
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  /// Shell assets win over the data endpoint, which wins over everything else.
  pub fn classify(&self, url: &Url) -> Classification {
    if is_shell_asset(url.path(), &self.manifest) {
      Classification::ShellAsset
    } else if self.endpoint.matches(url) {
      Classification::DataEndpoint
    } else {
      Classification::Generic
    }
  }
}
