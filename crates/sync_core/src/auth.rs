use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use shared::{domain::ActorId, protocol::AuthResponse};
use tracing::debug;
use url::Url;

use crate::error::CredentialError;

/// Short-lived credential presented on the push-channel handshake and on
/// every action call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub bearer_token: Option<String>,
    pub session_cookie: Option<String>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            session_cookie: None,
        }
    }

    pub fn cookie(token: impl Into<String>) -> Self {
        Self {
            bearer_token: None,
            session_cookie: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            bearer_token: None,
            session_cookie: None,
        }
    }

    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        match &self.session_cookie {
            Some(cookie) => request.header(header::COOKIE, format!("token={cookie}")),
            None => request,
        }
    }
}

/// Issues credentials. Called immediately before each handshake attempt, so
/// implementations must not assume a credential outlives one connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_credential(&self) -> Result<Credential, CredentialError>;
}

/// A credential handed over by the host application.
pub struct StaticCredentials(pub Credential);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch_credential(&self) -> Result<Credential, CredentialError> {
        Ok(self.0.clone())
    }
}

/// Exchanges the session cookie for a fresh bearer token at the auth service.
pub struct AuthServiceCredentials {
    http: Client,
    me_url: Url,
    session_cookie: String,
}

impl AuthServiceCredentials {
    pub fn new(auth_base: &Url, session_cookie: impl Into<String>) -> Result<Self, CredentialError> {
        let me_url = auth_base
            .join("/api/auth/me")
            .map_err(|err| CredentialError::Request(err.to_string()))?;
        Ok(Self {
            http: Client::new(),
            me_url,
            session_cookie: session_cookie.into(),
        })
    }

    /// Resolves who the session cookie belongs to.
    pub async fn whoami(&self) -> Result<AuthResponse, CredentialError> {
        let response = self
            .http
            .get(self.me_url.clone())
            .header(header::COOKIE, format!("token={}", self.session_cookie))
            .send()
            .await
            .map_err(|err| CredentialError::Request(err.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(CredentialError::Unauthenticated)
            }
            status if !status.is_success() => Err(CredentialError::Request(format!(
                "auth service answered {status}"
            ))),
            _ => response
                .json::<AuthResponse>()
                .await
                .map_err(|err| CredentialError::Request(err.to_string())),
        }
    }

    pub async fn actor_id(&self) -> Result<ActorId, CredentialError> {
        Ok(self.whoami().await?.user_id)
    }
}

#[async_trait]
impl CredentialProvider for AuthServiceCredentials {
    async fn fetch_credential(&self) -> Result<Credential, CredentialError> {
        let auth = self.whoami().await?;
        debug!(user_id = %auth.user_id, "auth: issued fresh credential");
        Ok(Credential {
            bearer_token: Some(auth.token),
            session_cookie: Some(self.session_cookie.clone()),
        })
    }
}
