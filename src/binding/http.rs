//! Remote binding speaking JSON over HTTP.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{Binding, CollectionInfo};
use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote service binding.
///
/// `POST {base}/perform` with the descriptor as the JSON body, and
/// `GET {base}/collections` for collection metadata.
#[derive(Clone)]
pub struct HttpBinding {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpBinding {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid binding url {}: {}", base_url, e))?;
    // Keep the last path segment when joining endpoints
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base
      .join(path)
      .map_err(|e| TransportError::Request(format!("invalid endpoint {}: {}", path, e)))
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send<T: serde::de::DeserializeOwned>(
    &self,
    request: reqwest::RequestBuilder,
  ) -> Result<T, TransportError> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| TransportError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(TransportError::Backend(format!("{}: {}", status, body)));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| TransportError::Request(format!("failed to decode response: {}", e)))
  }
}

#[async_trait]
impl Binding for HttpBinding {
  async fn perform(&self, query: &QueryDescriptor) -> Result<Value, TransportError> {
    let url = self.endpoint("perform")?;
    self.send(self.client.post(url).json(query)).await
  }

  async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError> {
    let url = self.endpoint("collections")?;
    self.send(self.client.get(url)).await
  }
}
