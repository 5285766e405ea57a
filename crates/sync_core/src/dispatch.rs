use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ActorId, BoardSnapshot, Cell},
    protocol::{InboundEnvelope, InboundKind},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    api::ActionApi,
    error::{DecodeError, StoreError},
    store::BoardStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Board(BoardSnapshot),
    /// Legacy per-square broadcast.
    Cell(Cell),
    /// Legacy reset broadcast without a board; the board must be fetched.
    ReloadRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub kind: InboundKind,
    pub payload: EventPayload,
    pub originating_actor: Option<ActorId>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Local, non-fatal problems worth surfacing next to the connectivity flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    DecodeFailed(DecodeError),
    StoreRejected {
        kind: InboundKind,
        error: StoreError,
    },
    ReloadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Applied {
        kind: InboundKind,
        revision: u64,
        self_origin: bool,
    },
    Dropped,
}

pub fn decode(raw: &str) -> Result<InboundEvent, DecodeError> {
    let envelope: InboundEnvelope =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let timestamp = envelope.sent_at();
    let kind = InboundKind::from_wire(&envelope.kind)
        .ok_or_else(|| DecodeError::UnknownKind(envelope.kind.clone()))?;

    let payload = match (kind, envelope.board, envelope.square) {
        (_, Some(board), _) => EventPayload::Board(board),
        (InboundKind::SquareCaptured | InboundKind::SquareDefended, None, Some(cell)) => {
            EventPayload::Cell(cell)
        }
        (InboundKind::WorldReset, None, None) => EventPayload::ReloadRequired,
        _ => return Err(DecodeError::MissingPayload(envelope.kind)),
    };

    Ok(InboundEvent {
        kind,
        payload,
        originating_actor: envelope.actor_id,
        timestamp,
    })
}

/// Applies decoded room events to the store, one at a time, in the order the
/// transport delivered them.
///
/// Self-originated events are applied like any other: the broadcast is the
/// authoritative confirmation and overwrites whatever the optimistic path
/// predicted.
pub struct Dispatcher {
    store: Arc<BoardStore>,
    local_actor: Option<ActorId>,
    diagnostics: broadcast::Sender<Diagnostic>,
    board_source: Option<Arc<dyn ActionApi>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<BoardStore>,
        local_actor: Option<ActorId>,
        diagnostics: broadcast::Sender<Diagnostic>,
    ) -> Self {
        Self {
            store,
            local_actor,
            diagnostics,
            board_source: None,
        }
    }

    /// Where boardless reset broadcasts fetch the replacement board from.
    pub fn with_board_source(mut self, api: Arc<dyn ActionApi>) -> Self {
        self.board_source = Some(api);
        self
    }

    pub async fn dispatch(&self, raw: &str) -> Dispatched {
        match decode(raw) {
            Ok(event) => self.route(event).await,
            Err(err) => {
                warn!(error = %err, "realtime: dropping undecodable room event");
                let _ = self.diagnostics.send(Diagnostic::DecodeFailed(err));
                Dispatched::Dropped
            }
        }
    }

    /// Exactly one store call per event.
    pub async fn route(&self, event: InboundEvent) -> Dispatched {
        let self_origin = self.local_actor.is_some()
            && event.originating_actor.as_ref() == self.local_actor.as_ref();
        if self_origin {
            debug!(kind = ?event.kind, "realtime: applying self-originated event as confirmation");
        }

        let kind = event.kind;
        let result = match (kind, event.payload) {
            (InboundKind::WorldReset, EventPayload::Board(board)) => {
                self.store.apply_reset(board).await
            }
            (_, EventPayload::Board(board)) => self.store.replace_board(board).await,
            (_, EventPayload::ReloadRequired) => match self.reload_board().await {
                Some(board) => self.store.apply_reset(board).await,
                None => return Dispatched::Dropped,
            },
            (_, EventPayload::Cell(cell)) => self
                .store
                .upsert_cell(cell)
                .await
                .map(|upserted| upserted.revision),
        };

        match result {
            Ok(revision) => Dispatched::Applied {
                kind,
                revision,
                self_origin,
            },
            Err(error) => {
                warn!(kind = ?kind, %error, "realtime: store rejected room event");
                let _ = self
                    .diagnostics
                    .send(Diagnostic::StoreRejected { kind, error });
                Dispatched::Dropped
            }
        }
    }

    /// Fetches the room's board inline, so later events still apply after it.
    async fn reload_board(&self) -> Option<BoardSnapshot> {
        let Some(room) = self.store.room().await else {
            let error = StoreError::NotLoaded;
            warn!(%error, "realtime: reset broadcast arrived with no room loaded");
            let _ = self.diagnostics.send(Diagnostic::StoreRejected {
                kind: InboundKind::WorldReset,
                error,
            });
            return None;
        };
        let result = match &self.board_source {
            Some(api) => api.board(&room).await.map_err(|err| err.to_string()),
            None => Err("no board source configured".to_string()),
        };
        match result {
            Ok(board) => {
                debug!(room = %room, "realtime: reloaded board after reset broadcast");
                Some(board)
            }
            Err(reason) => {
                warn!(room = %room, %reason, "realtime: failed to reload board after reset");
                let _ = self.diagnostics.send(Diagnostic::ReloadFailed(reason));
                None
            }
        }
    }

    /// Drains the inbound queue until every sender is gone.
    pub async fn run(self, mut inbound: mpsc::Receiver<String>) {
        while let Some(raw) = inbound.recv().await {
            self.dispatch(&raw).await;
        }
        debug!("realtime: dispatcher stopped");
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
