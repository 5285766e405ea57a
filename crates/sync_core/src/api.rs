use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{BoardSnapshot, RoomId, WorldMeta},
    error::{ApiException, ServerErrorBody},
    protocol::{ActionResponse, CellActionRequest, ResetRequest},
};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
    auth::CredentialProvider,
    config::SyncConfig,
    error::{ConfigError, CredentialError},
};

#[derive(Debug, Clone, Error)]
pub enum ApiCallError {
    #[error("{0}")]
    Status(#[from] ApiException),
    #[error("request failed: {0}")]
    Network(String),
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error("undecodable response: {0}")]
    Decode(String),
}

/// The authoritative game service. Game rules live behind it.
#[async_trait]
pub trait ActionApi: Send + Sync {
    async fn capture(
        &self,
        room: &RoomId,
        request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError>;
    async fn defend(
        &self,
        room: &RoomId,
        request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError>;
    /// The response body is ignored; the replacement board arrives by broadcast.
    async fn reset(&self, room: &RoomId, request: ResetRequest) -> Result<(), ApiCallError>;
    async fn board(&self, room: &RoomId) -> Result<BoardSnapshot, ApiCallError>;
    async fn world(&self, room: &RoomId) -> Result<WorldMeta, ApiCallError>;
}

pub struct HttpActionApi {
    http: Client,
    worlds_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpActionApi {
    pub fn new(
        config: &SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            http: Client::new(),
            worlds_url: config.endpoint("api/worlds")?,
            credentials,
        })
    }

    fn world_url(&self, room: &RoomId, tail: &[&str]) -> Url {
        let mut url = self.worlds_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(room.as_str()).extend(tail);
        }
        url
    }

    async fn call<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T, ApiCallError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let bytes = self.call_raw(method, url, body).await?;
        serde_json::from_slice(&bytes).map_err(|err| ApiCallError::Decode(err.to_string()))
    }

    async fn call_raw<B>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Vec<u8>, ApiCallError>
    where
        B: Serialize + Sync,
    {
        let credential = self.credentials.fetch_credential().await?;
        debug!(%method, %url, "actions: calling game service");
        let mut request = credential.apply(self.http.request(method, url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ApiCallError::Network(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ApiCallError::Network(err.to_string()))?;
        if !status.is_success() {
            let body = serde_json::from_slice::<ServerErrorBody>(&bytes).ok();
            return Err(ApiException::new(status.as_u16(), body).into());
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ActionApi for HttpActionApi {
    async fn capture(
        &self,
        room: &RoomId,
        request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError> {
        let url = self.world_url(room, &["actions", "capture"]);
        self.call(Method::POST, url, Some(&request)).await
    }

    async fn defend(
        &self,
        room: &RoomId,
        request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError> {
        let url = self.world_url(room, &["actions", "defend"]);
        self.call(Method::POST, url, Some(&request)).await
    }

    async fn reset(&self, room: &RoomId, request: ResetRequest) -> Result<(), ApiCallError> {
        let url = self.world_url(room, &["reset"]);
        self.call_raw(Method::POST, url, Some(&request)).await?;
        Ok(())
    }

    async fn board(&self, room: &RoomId) -> Result<BoardSnapshot, ApiCallError> {
        let url = self.world_url(room, &["board"]);
        self.call::<(), _>(Method::GET, url, None).await
    }

    async fn world(&self, room: &RoomId) -> Result<WorldMeta, ApiCallError> {
        let url = self.world_url(room, &[]);
        self.call::<(), _>(Method::GET, url, None).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
