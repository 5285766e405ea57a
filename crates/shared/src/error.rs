use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the game service. Every field is optional because
/// proxies and framework defaults answer with partial bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerErrorBody {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: None,
            message: Some(message.into()),
        }
    }

    /// The human-readable message, if the server supplied a non-empty one.
    pub fn message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|message| !message.trim().is_empty())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code:?} ({status}): {}", .message.as_deref().unwrap_or("no message"))]
pub struct ApiException {
    pub code: ErrorCode,
    pub status: u16,
    pub message: Option<String>,
}

impl ApiException {
    pub fn new(status: u16, body: Option<ServerErrorBody>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message: body
                .as_ref()
                .and_then(ServerErrorBody::message)
                .map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_is_kept_verbatim() {
        let body = ServerErrorBody::new(400, "  Square is protected.\n");
        assert_eq!(body.message(), Some("  Square is protected.\n"));

        let err = ApiException::new(400, Some(body));
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message.as_deref(), Some("  Square is protected.\n"));
    }

    #[test]
    fn blank_server_message_counts_as_absent() {
        for blank in ["", "   ", "\n"] {
            let err = ApiException::new(503, Some(ServerErrorBody::new(503, blank)));
            assert_eq!(err.message, None);
        }
        assert_eq!(ApiException::new(404, None).code, ErrorCode::NotFound);
    }
}
