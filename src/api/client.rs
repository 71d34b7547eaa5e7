use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::Category;
use super::{ApiError, RemoteApi};
use crate::config::Config;
use crate::domain::{EntityId, EstablishmentId};
use crate::sync::network::ConnectivityProbe;

/// REST client for the establishment backend.
#[derive(Clone)]
pub struct HttpApiClient {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpApiClient {
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    Self::with_base_url(
      &config.api.url,
      Config::get_api_token(),
      config.sync.request_timeout(),
    )
  }

  pub fn with_base_url(
    base_url: &str,
    token: Option<String>,
    timeout: Duration,
  ) -> color_eyre::Result<Self> {
    let mut base = Url::parse(base_url)?;
    // Url::join replaces the last segment unless the path ends with '/'
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    let client = reqwest::Client::builder().timeout(timeout).build()?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn categories_url(&self, establishment: EstablishmentId) -> Result<Url, ApiError> {
    self
      .base
      .join(&format!("establishments/{}/categories", establishment))
      .map_err(|e| ApiError::Transient(format!("invalid endpoint: {}", e)))
  }

  fn category_url(&self, establishment: EstablishmentId, id: EntityId) -> Result<Url, ApiError> {
    self
      .base
      .join(&format!("establishments/{}/categories/{}", establishment, id))
      .map_err(|e| ApiError::Transient(format!("invalid endpoint: {}", e)))
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
    let response = self
      .authorized(request)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
  }

  async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
    self
      .execute(request)
      .await?
      .json::<T>()
      .await
      .map_err(|e| ApiError::Transient(format!("invalid response body: {}", e)))
  }
}

/// Map a transport-level failure.
fn classify_transport(err: reqwest::Error) -> ApiError {
  if err.is_timeout() {
    ApiError::Timeout
  } else if err.is_connect() {
    ApiError::Offline(err.to_string())
  } else {
    ApiError::Transient(err.to_string())
  }
}

/// Map a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str) -> ApiError {
  let detail = if body.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, body)
  };

  match status {
    StatusCode::NOT_FOUND => ApiError::NotFound(detail),
    StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED | StatusCode::UNPROCESSABLE_ENTITY => {
      ApiError::Conflict(detail)
    }
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
    StatusCode::REQUEST_TIMEOUT => ApiError::Timeout,
    _ => ApiError::Transient(detail),
  }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
  async fn list(&self, establishment: EstablishmentId) -> Result<Vec<Category>, ApiError> {
    let url = self.categories_url(establishment)?;
    debug!(%url, "listing categories");
    self.json(self.client.get(url)).await
  }

  async fn create(
    &self,
    establishment: EstablishmentId,
    payload: &Value,
  ) -> Result<Category, ApiError> {
    let url = self.categories_url(establishment)?;
    debug!(%url, "creating category");
    self.json(self.client.post(url).json(payload)).await
  }

  async fn update(
    &self,
    establishment: EstablishmentId,
    id: EntityId,
    payload: &Value,
  ) -> Result<Category, ApiError> {
    let url = self.category_url(establishment, id)?;
    debug!(%url, "updating category");
    self.json(self.client.put(url).json(payload)).await
  }

  async fn delete(&self, establishment: EstablishmentId, id: EntityId) -> Result<(), ApiError> {
    let url = self.category_url(establishment, id)?;
    debug!(%url, "deleting category");
    self.execute(self.client.delete(url)).await?;
    Ok(())
  }
}

#[async_trait]
impl ConnectivityProbe for HttpApiClient {
  /// Any HTTP answer, even an error status, proves the backend is reachable.
  async fn is_reachable(&self) -> bool {
    match self.authorized(self.client.head(self.base.clone())).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        false
      }
    }
  }
}
