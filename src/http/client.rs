use crate::config::NetworkConfig;
use crate::http::types::{Request, Response};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// The network failed to produce any response at all.
///
/// A response with a non-success status is not a `FetchError`; it resolves
/// normally and the caller decides what to do with the status.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("connection failed: {0}")]
  Connect(String),

  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("transport error: {0}")]
  Transport(String),
}

/// Network capability used by the strategies and by install.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// Network client backed by reqwest
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder =
      reqwest::Client::builder().user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")));

    if let Some(secs) = config.connect_timeout_secs {
      builder = builder.connect_timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::Transport(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder.send().await.map_err(classify_error)?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(classify_error)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout(e.to_string())
  } else if e.is_connect() {
    FetchError::Connect(e.to_string())
  } else {
    FetchError::Transport(e.to_string())
  }
}
