//! Named store handles and generation naming.

use color_eyre::Result;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestIdentity};
use crate::http::Response;

/// Handle to one named store inside a storage backend.
pub struct StoreHandle<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> StoreHandle<S> {
  /// Open (or create) the named store.
  pub fn open(storage: Arc<S>, name: &str) -> Result<Self> {
    storage.open(name)?;
    Ok(Self::unopened(storage, name))
  }

  /// Handle for a store that may not exist yet. Reads miss until the
  /// first write creates it.
  pub fn unopened(storage: Arc<S>, name: &str) -> Self {
    Self {
      storage,
      name: name.to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn get(&self, identity: &RequestIdentity) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.name, identity)
  }

  pub fn put(&self, identity: &RequestIdentity, response: &Response) -> Result<()> {
    self.storage.put(&self.name, identity, response)
  }
}

impl<S: CacheStorage> Clone for StoreHandle<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}

/// Names of the current store generations.
///
/// Both names embed their version tag, so bumping a version yields a new
/// generation and leaves the old one to be pruned on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  pub shell: String,
  pub data: String,
}

impl StoreNames {
  pub fn new(prefix: &str, shell_version: &str, data_version: &str) -> Self {
    Self {
      shell: format!("{}-shell-{}", prefix, shell_version),
      data: format!("{}-data-{}", prefix, data_version),
    }
  }

  /// Whether a store name belongs to one of the current generations.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.shell || name == self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use url::Url;

  #[test]
  fn test_names_embed_versions() {
    let names = StoreNames::new("cocktail-pwa", "v3", "v1");
    assert_eq!(names.shell, "cocktail-pwa-shell-v3");
    assert_eq!(names.data, "cocktail-pwa-data-v1");
    assert!(names.is_current("cocktail-pwa-shell-v3"));
    assert!(!names.is_current("cocktail-pwa-shell-v2"));
  }

  #[test]
  fn test_handle_reads_and_writes_its_own_store() {
    let storage = Arc::new(MemoryStorage::new());
    let shell = StoreHandle::open(Arc::clone(&storage), "shell").unwrap();
    let data = StoreHandle::unopened(Arc::clone(&storage), "data");
    let id = RequestIdentity::from_url(&Url::parse("https://h.test/main.js").unwrap());

    shell.put(&id, &Response::new(200, "js")).unwrap();

    assert!(shell.get(&id).unwrap().is_some());
    assert!(data.get(&id).unwrap().is_none());
    assert_eq!(storage.keys().unwrap(), vec!["shell".to_string()]);
  }
}
