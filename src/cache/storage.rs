//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestIdentity};
use crate::http::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. Each store maps a
/// [`RequestIdentity`] to one captured response; writing an identity that is
/// already present replaces it.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Store a response, creating the store if needed.
  fn put(&self, name: &str, identity: &RequestIdentity, response: &Response) -> Result<()>;

  /// Seed a store with every entry or none of them.
  ///
  /// The store only becomes visible through [`CacheStorage::keys`] once all
  /// entries have been written.
  fn put_all(&self, name: &str, entries: &[(RequestIdentity, Response)]) -> Result<()>;

  /// Look up a response in the named store.
  fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedResponse>>;

  /// Names of all existing stores.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and every entry in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Number of entries in the named store.
  fn len(&self, name: &str) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<BTreeMap<String, HashMap<RequestIdentity, CachedResponse>>>,
  meta: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    stores.entry(name.to_string()).or_default();
    Ok(())
  }

  fn put(&self, name: &str, identity: &RequestIdentity, response: &Response) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    stores.entry(name.to_string()).or_default().insert(
      identity.clone(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(RequestIdentity, Response)]) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = Utc::now();
    let store = stores.entry(name.to_string()).or_default();
    for (identity, response) in entries {
      store.insert(
        identity.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedResponse>> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      stores
        .get(name)
        .and_then(|store| store.get(identity))
        .cloned(),
    )
  }

  fn keys(&self) -> Result<Vec<String>> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.keys().cloned().collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.remove(name).is_some())
  }

  fn len(&self, name: &str) -> Result<usize> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.get(name).map(HashMap::len).unwrap_or(0))
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let meta = self.meta.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(meta.get(key).cloned())
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let mut meta = self.meta.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    meta.insert(key.to_string(), value.to_string());
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per store generation
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses keyed by request identity
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    locator TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, key_hash),
    FOREIGN KEY (store) REFERENCES stores(name) ON DELETE CASCADE
);

-- Lifecycle bookkeeping
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const INSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO entries (store, key_hash, locator, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

fn insert_entry(
  conn: &Connection,
  name: &str,
  identity: &RequestIdentity,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      INSERT_ENTRY,
      params![
        name,
        identity.digest(),
        identity.as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", identity, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    Ok(())
  }

  fn put(&self, name: &str, identity: &RequestIdentity, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    insert_entry(&conn, name, identity, response)
  }

  fn put_all(&self, name: &str, entries: &[(RequestIdentity, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    for (identity, response) in entries {
      insert_entry(&tx, name, identity, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE store = ? AND key_hash = ?",
        params![name, identity.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", identity, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn len(&self, name: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE store = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(count as usize)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn identity(url: &str) -> RequestIdentity {
    RequestIdentity::from_url(&Url::parse(url).unwrap())
  }

  fn sqlite() -> (tempfile::TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open_at(&dir.path().join("cache.db")).unwrap();
    (dir, storage)
  }

  fn exercise_put_overwrites(storage: &dyn CacheStorage) {
    let id = identity("https://h.test/search.php?s=rum");
    storage.put("data-v1", &id, &Response::new(200, "first")).unwrap();
    storage.put("data-v1", &id, &Response::new(200, "second")).unwrap();

    assert_eq!(storage.len("data-v1").unwrap(), 1);
    let cached = storage.get("data-v1", &id).unwrap().unwrap();
    assert_eq!(cached.response.text(), "second");
  }

  fn exercise_delete(storage: &dyn CacheStorage) {
    storage.open("shell-v1").unwrap();
    storage.open("shell-v2").unwrap();
    storage
      .put("shell-v1", &identity("https://h.test/"), &Response::new(200, "x"))
      .unwrap();

    assert!(storage.delete("shell-v1").unwrap());
    assert!(!storage.delete("shell-v1").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["shell-v2".to_string()]);
    assert!(storage
      .get("shell-v1", &identity("https://h.test/"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_memory_put_overwrites() {
    exercise_put_overwrites(&MemoryStorage::new());
  }

  #[test]
  fn test_memory_delete() {
    exercise_delete(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_put_overwrites() {
    let (_dir, storage) = sqlite();
    exercise_put_overwrites(&storage);
  }

  #[test]
  fn test_sqlite_delete() {
    let (_dir, storage) = sqlite();
    exercise_delete(&storage);
  }

  #[test]
  fn test_sqlite_roundtrips_headers_and_status() {
    let (_dir, storage) = sqlite();
    let id = identity("https://h.test/styles/main.css");
    let response = Response::new(200, "body{}").with_header("Content-Type", "text/css");
    storage.put_all("shell-v3", &[(id.clone(), response.clone())]).unwrap();

    let cached = storage.get("shell-v3", &id).unwrap().unwrap();
    assert_eq!(cached.response, response);
  }

  #[test]
  fn test_sqlite_put_all_failure_leaves_no_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let storage = SqliteStorage::open_at(&path).unwrap();
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch(
          "CREATE TRIGGER reject_broken BEFORE INSERT ON entries
           WHEN NEW.locator LIKE '%broken%'
           BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
    }

    let index = identity("https://h.test/index.html");
    let result = storage.put_all(
      "shell-v4",
      &[
        (index.clone(), Response::new(200, "<html>")),
        (identity("https://h.test/broken.js"), Response::new(200, "js")),
      ],
    );

    assert!(result.is_err());
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.get("shell-v4", &index).unwrap().is_none());
    assert_eq!(storage.len("shell-v4").unwrap(), 0);
  }

  #[test]
  fn test_sqlite_meta() {
    let (_dir, storage) = sqlite();
    assert_eq!(storage.get_meta("active_generation").unwrap(), None);
    storage.set_meta("active_generation", "a").unwrap();
    storage.set_meta("active_generation", "b").unwrap();
    assert_eq!(
      storage.get_meta("active_generation").unwrap(),
      Some("b".to_string())
    );
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let id = identity("https://h.test/index.html");
    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("shell-v3", &id, &Response::new(200, "<html>")).unwrap();
    }
    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["shell-v3".to_string()]);
    assert!(storage.get("shell-v3", &id).unwrap().is_some());
  }
}
