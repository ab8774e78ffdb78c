use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::cache::{Request, Response, Transport};
use crate::config::Config;
use crate::queue::PendingOperation;
use crate::sync::{Broadcaster, HealthProbe};

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
  reqwest::Client::builder()
    .timeout(timeout)
    .user_agent(concat!("ledgersync/", env!("CARGO_PKG_VERSION")))
    .build()
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))
}

/// Network transport behind the response cache
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self> {
    let client = build_client(config.sync.request_timeout())?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Submits queued operations to the ledger's broadcast endpoint
#[derive(Clone)]
pub struct HttpBroadcaster {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpBroadcaster {
  pub fn new(config: &Config) -> Result<Self> {
    let client = build_client(config.sync.request_timeout())?;
    let endpoint = Url::parse(&config.sync.broadcast_url)
      .map_err(|e| eyre!("Invalid broadcast URL '{}': {}", config.sync.broadcast_url, e))?;

    Ok(Self {
      client,
      endpoint,
      token: Config::get_api_token(),
    })
  }
}

/// JSON body sent for one operation.
fn operation_body(operation: &PendingOperation) -> Value {
  json!({
    "id": operation.id,
    "kind": operation.kind,
    "params": operation.params,
    "enqueued_at": operation.enqueued_at,
  })
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
  async fn dispatch(&self, operation: &PendingOperation) -> Result<()> {
    // A timed-out dispatch may still have landed; the key lets the ledger
    // drop the retry.
    let mut builder = self
      .client
      .post(self.endpoint.clone())
      .header("idempotency-key", format!("op-{}", operation.id))
      .json(&operation_body(operation));
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to dispatch operation {}: {}", operation.id, e))?;

    let status = response.status();
    if !status.is_success() {
      let detail = response.text().await.unwrap_or_default();
      return Err(eyre!(
        "Ledger rejected operation {} ({}): {}",
        operation.id,
        status,
        detail.trim()
      ));
    }

    Ok(())
  }
}

/// Reachability check against the ledger's health URL
#[derive(Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(config: &Config) -> Result<Self> {
    let url = config.health_url()?;
    let client = build_client(Duration::from_secs(5))?;
    Ok(Self { client, url })
  }
}

#[async_trait]
impl HealthProbe for HttpProbe {
  async fn is_reachable(&self) -> bool {
    match self.client.get(self.url.clone()).send().await {
      Ok(response) => response.status().is_success(),
      Err(_) => false,
    }
  }
}
