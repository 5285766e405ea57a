use shared::domain::{ActionKind, Coord};
use thiserror::Error;

use crate::api::ApiCallError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url '{value}': {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Push-channel failure. Never returned to callers of the connection manager;
/// reported on its status channel and logged.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("credential fetch failed: {0}")]
    Credential(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("server rejected handshake: {0}")]
    HandshakeRejected(String),
    #[error("server error frame: {0}")]
    ServerError(String),
    #[error("no heartbeat from server within {0:?}")]
    HeartbeatMissed(std::time::Duration),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Receive(String),
    #[error("connection closed by server")]
    ClosedByServer,
    #[error("malformed frame: {0}")]
    Frame(String),
}

/// Inbound payload that could not be turned into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unknown event type '{0}'")]
    UnknownKind(String),
    #[error("event '{0}' carries neither a board nor a square")]
    MissingPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no room loaded")]
    NotLoaded,
    #[error("cell {0} is not on the loaded board")]
    UnknownCell(Coord),
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("auth service request failed: {0}")]
    Request(String),
}

/// Outcome categories surfaced through the store's error slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{0}")]
    Precondition(String),
    #[error("{message}")]
    Validation { kind: ActionKind, message: String },
    #[error("{message}")]
    NotFound { kind: ActionKind, message: String },
    /// Any other server refusal; `message` is the server's text, verbatim.
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("{message}")]
    Unavailable { kind: ActionKind, message: String },
}

impl ActionError {
    pub fn not_logged_in() -> Self {
        Self::Precondition("Please login first".to_string())
    }

    pub fn no_world_loaded() -> Self {
        Self::Precondition("No world loaded".to_string())
    }

    pub fn invalid_move(kind: ActionKind) -> Self {
        let message = match kind {
            ActionKind::Capture => "Invalid move! You can only capture adjacent squares.",
            ActionKind::Defend => "Invalid move! You can only defend your own squares.",
            ActionKind::Reset => "Invalid move! The world cannot be reset right now.",
        };
        Self::Validation {
            kind,
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: ActionKind) -> Self {
        let message = match kind {
            ActionKind::Capture | ActionKind::Defend => "Square not found.",
            ActionKind::Reset => "World not found.",
        };
        Self::NotFound {
            kind,
            message: message.to_string(),
        }
    }

    pub fn unavailable(kind: ActionKind) -> Self {
        let message = match kind {
            ActionKind::Capture => "Failed to capture square. Please try again.",
            ActionKind::Defend => "Failed to defend square. Please try again.",
            ActionKind::Reset => "Failed to reset world. Please try again.",
        };
        Self::Unavailable {
            kind,
            message: message.to_string(),
        }
    }

    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load room: {0}")]
    Load(#[from] ApiCallError),
}
