//! Core types for the response store.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Response;

/// Canonical cache key for a request.
///
/// Derived from the full locator (scheme, host, port, path and query). The
/// fragment never reaches the network and is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestIdentity(String);

impl RequestIdentity {
  pub fn from_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(url.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 of the locator, used as a stable fixed-length primary key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A response held by a store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The captured response, returned verbatim on a hit
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identity_drops_fragment() {
    let url = Url::parse("https://example.com/a/b.png?x=1#section").unwrap();
    let identity = RequestIdentity::from_url(&url);
    assert_eq!(identity.as_str(), "https://example.com/a/b.png?x=1");
  }

  #[test]
  fn test_identity_keeps_query() {
    let a = RequestIdentity::from_url(&Url::parse("https://h.test/search.php?s=mojito").unwrap());
    let b = RequestIdentity::from_url(&Url::parse("https://h.test/search.php?s=negroni").unwrap());
    assert_ne!(a, b);
    assert_ne!(a.digest(), b.digest());
  }

  #[test]
  fn test_digest_is_stable_hex() {
    let identity = RequestIdentity::from_url(&Url::parse("https://h.test/").unwrap());
    assert_eq!(identity.digest().len(), 64);
    assert_eq!(identity.digest(), identity.clone().digest());
  }
}
