use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// App shell files precached on install.
pub const DEFAULT_MANIFEST: &[&str] = &[
  "./",
  "./index.html",
  "./main.js",
  "./styles/main.css",
  "./scripts/app.js",
  "./manifest.json",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Shell generation tag; bump it whenever a shell asset changes
  pub version: String,
  /// Data-endpoint generation tag
  pub data_version: String,
  /// Common prefix of every store name
  pub cache_prefix: String,
  /// Base URL the manifest entries resolve against
  pub scope: String,
  /// Relative paths of the app shell, in order
  pub manifest: Vec<String>,
  pub data_endpoint: DataEndpointConfig,
  pub storage: StorageConfig,
  pub network: NetworkConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "v3".to_string(),
      data_version: "v1".to_string(),
      cache_prefix: "cocktail-pwa".to_string(),
      scope: "http://localhost:8080/".to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      data_endpoint: DataEndpointConfig::default(),
      storage: StorageConfig::default(),
      network: NetworkConfig::default(),
      log: LogConfig::default(),
    }
  }
}

/// The remote search resource whose responses are cached separately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataEndpointConfig {
  /// Exact host, e.g. "www.thecocktaildb.com"
  pub host: String,
  /// Exact path, no suffix matching
  pub path: String,
}

impl Default for DataEndpointConfig {
  fn default() -> Self {
    Self {
      host: "www.thecocktaildb.com".to_string(),
      path: "/api/json/v1/1/search.php".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database path (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub path: Option<PathBuf>,
  /// Keep everything in memory; nothing survives the process
  pub in_memory: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
  /// Filter directive used when SHELLCACHE_LOG is unset
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      file: None,
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// The scope as a URL. Always ends in `/` so relative entries resolve below it.
  pub fn scope_url(&self) -> Result<Url> {
    let mut scope = self.scope.clone();
    if !scope.ends_with('/') {
      scope.push('/');
    }
    let url = Url::parse(&scope).map_err(|e| eyre!("Invalid scope '{}': {}", self.scope, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("scope must be a base URL, got {}", self.scope));
    }
    Ok(url)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.data_version.trim().is_empty() {
      return Err(eyre!("data_version must not be empty"));
    }
    self.scope_url()?;
    if !self.data_endpoint.path.starts_with('/') {
      return Err(eyre!(
        "data_endpoint.path must be absolute, got {}",
        self.data_endpoint.path
      ));
    }
    Ok(())
  }
}
