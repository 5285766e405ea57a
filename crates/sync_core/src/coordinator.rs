use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ActionKind, ActorId, Cell, Coord, RoomId},
    error::ErrorCode,
    protocol::{ActionResponse, CellActionRequest, ResetRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    api::{ActionApi, ApiCallError},
    error::{ActionError, CredentialError, StoreError},
    store::{BoardStore, StoreEvent},
    SessionContext,
};

/// The one mutating action a session may have outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub target: Option<Coord>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// The service accepted the action and its answer is in the store.
    Confirmed,
    /// Another action was pending; nothing was sent.
    Ignored,
    /// Reset accepted; the store flips `resetting` off when the replacement
    /// board is applied.
    AwaitingBroadcast,
}

#[derive(Debug, Clone, Copy)]
enum CellIntent {
    Capture,
    Defend,
}

impl CellIntent {
    fn kind(self) -> ActionKind {
        match self {
            Self::Capture => ActionKind::Capture,
            Self::Defend => ActionKind::Defend,
        }
    }
}

/// Turns capture/defend/reset intents into Action API calls.
///
/// Optimistic: the predicted cell is written before the call, overwritten by
/// the service's answer on success and rolled back on failure. The call runs
/// on its own task, so dropping the returned future never abandons an action
/// already sent.
#[derive(Clone)]
pub struct ActionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    session: SessionContext,
    api: Arc<dyn ActionApi>,
    store: Arc<BoardStore>,
    pending: Mutex<Option<PendingAction>>,
    reset_confirmation_timeout: Duration,
    max_defense_bonus: u32,
}

impl ActionCoordinator {
    pub fn new(
        session: SessionContext,
        api: Arc<dyn ActionApi>,
        store: Arc<BoardStore>,
        reset_confirmation_timeout: Duration,
        max_defense_bonus: u32,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                session,
                api,
                store,
                pending: Mutex::new(None),
                reset_confirmation_timeout,
                max_defense_bonus,
            }),
        }
    }

    pub async fn pending(&self) -> Option<PendingAction> {
        self.inner.pending.lock().await.clone()
    }

    pub async fn request_capture(&self, coord: Coord) -> Result<ActionStatus, ActionError> {
        self.request_cell_action(CellIntent::Capture, coord).await
    }

    pub async fn request_defend(&self, coord: Coord) -> Result<ActionStatus, ActionError> {
        self.request_cell_action(CellIntent::Defend, coord).await
    }

    pub async fn request_reset(&self) -> Result<ActionStatus, ActionError> {
        let (actor, room) = self.inner.preconditions().await?;
        if !self.inner.admit(ActionKind::Reset, None).await {
            return Ok(ActionStatus::Ignored);
        }

        let inner = Arc::clone(&self.inner);
        match tokio::spawn(inner.run_reset(actor, room)).await {
            Ok(result) => result,
            Err(err) => Err(self.inner.recover(ActionKind::Reset, err).await),
        }
    }

    async fn request_cell_action(
        &self,
        intent: CellIntent,
        coord: Coord,
    ) -> Result<ActionStatus, ActionError> {
        let kind = intent.kind();
        let (actor, room) = self.inner.preconditions().await?;
        if !self.inner.admit(kind, Some(coord)).await {
            return Ok(ActionStatus::Ignored);
        }

        let inner = Arc::clone(&self.inner);
        match tokio::spawn(inner.run_cell_action(intent, actor, room, coord)).await {
            Ok(result) => result,
            Err(err) => Err(self.inner.recover(kind, err).await),
        }
    }
}

impl CoordinatorInner {
    async fn preconditions(&self) -> Result<(ActorId, RoomId), ActionError> {
        let checked = match (&self.session.local_actor, self.store.room().await) {
            (None, _) => Err(ActionError::not_logged_in()),
            (Some(_), None) => Err(ActionError::no_world_loaded()),
            (Some(actor), Some(room)) => Ok((actor.clone(), room)),
        };
        if let Err(err) = &checked {
            self.store.set_error(Some(err.user_message())).await;
        }
        checked
    }

    async fn admit(&self, kind: ActionKind, target: Option<Coord>) -> bool {
        let mut pending = self.pending.lock().await;
        if let Some(active) = pending.as_ref() {
            debug!(
                active = %active.kind,
                requested = %kind,
                "actions: ignoring request while another action is pending"
            );
            return false;
        }
        *pending = Some(PendingAction {
            kind,
            target,
            submitted_at: Utc::now(),
        });
        true
    }

    async fn release(&self) {
        self.pending.lock().await.take();
    }

    fn predict(&self, intent: CellIntent, actor: &ActorId, current: &Cell) -> Cell {
        match intent {
            CellIntent::Capture => current.clone().with_owner(Some(actor.clone())),
            CellIntent::Defend => current
                .clone()
                .with_defense_bonus((current.defense_bonus + 1).min(self.max_defense_bonus)),
        }
    }

    async fn run_cell_action(
        self: Arc<Self>,
        intent: CellIntent,
        actor: ActorId,
        room: RoomId,
        coord: Coord,
    ) -> Result<ActionStatus, ActionError> {
        let kind = intent.kind();
        // The prediction is derived from whatever the cell holds right now.
        let prediction = match self
            .store
            .modify_cell(coord, |current| self.predict(intent, &actor, current))
            .await
        {
            Ok(prediction) => prediction,
            Err(err) => {
                let mapped = match err {
                    StoreError::NotLoaded => ActionError::no_world_loaded(),
                    StoreError::UnknownCell(_) => ActionError::not_found(kind),
                };
                debug!(action = %kind, error = %err, "actions: no cell to act on");
                self.store.set_error(Some(mapped.user_message())).await;
                self.release().await;
                return Err(mapped);
            }
        };
        self.store.set_processing(true).await;
        self.store.set_error(None).await;

        let request = CellActionRequest {
            x: coord.x,
            y: coord.y,
            actor_id: Some(actor),
        };
        let response = match intent {
            CellIntent::Capture => self.api.capture(&room, request).await,
            CellIntent::Defend => self.api.defend(&room, request).await,
        };

        let outcome = match response {
            Ok(ActionResponse::Cell(cell)) => {
                if let Err(err) = self.store.upsert_cell(cell).await {
                    warn!(action = %kind, error = %err, "actions: service returned a cell the store cannot place");
                }
                Ok(ActionStatus::Confirmed)
            }
            Ok(ActionResponse::Board(board)) => {
                if let Err(err) = self.store.replace_board(board).await {
                    warn!(action = %kind, error = %err, "actions: service returned a board after the room was left");
                }
                Ok(ActionStatus::Confirmed)
            }
            Err(err) => {
                let rolled_back = self
                    .store
                    .restore_cell_if(&prediction.updated, prediction.original)
                    .await;
                let mapped = map_api_error(kind, &err);
                warn!(
                    action = %kind,
                    error = %err,
                    rolled_back,
                    "actions: action failed"
                );
                self.store.set_error(Some(mapped.user_message())).await;
                Err(mapped)
            }
        };

        self.store.set_processing(false).await;
        self.release().await;
        outcome
    }

    async fn run_reset(
        self: Arc<Self>,
        actor: ActorId,
        room: RoomId,
    ) -> Result<ActionStatus, ActionError> {
        // Subscribe before the call so a fast broadcast is not missed.
        let confirmations = self.store.subscribe();
        self.store.set_error(None).await;
        self.store.set_processing(true).await;
        self.store.set_resetting(true).await;

        let result = self
            .api
            .reset(
                &room,
                ResetRequest {
                    actor_id: Some(actor),
                },
            )
            .await;
        self.store.set_processing(false).await;

        match result {
            Err(err) => {
                let mapped = map_api_error(ActionKind::Reset, &err);
                warn!(error = %err, "actions: reset failed");
                self.store.set_resetting(false).await;
                self.store.set_error(Some(mapped.user_message())).await;
                self.release().await;
                Err(mapped)
            }
            Ok(()) if !self.store.is_resetting().await => {
                debug!("actions: reset broadcast arrived before the call returned");
                self.release().await;
                Ok(ActionStatus::Confirmed)
            }
            Ok(()) => {
                info!(room = %room, "actions: reset accepted, waiting for replacement board");
                tokio::spawn(Arc::clone(&self).await_reset_confirmation(room, confirmations));
                Ok(ActionStatus::AwaitingBroadcast)
            }
        }
    }

    async fn await_reset_confirmation(
        self: Arc<Self>,
        room: RoomId,
        mut events: broadcast::Receiver<StoreEvent>,
    ) {
        let deadline = tokio::time::sleep(self.reset_confirmation_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.reload_after_reset(&room).await;
                    break;
                }
                event = events.recv() => match event {
                    Ok(StoreEvent::ResettingChanged(false)) | Ok(StoreEvent::Cleared) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !self.store.is_resetting().await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        self.release().await;
    }

    /// No broadcast in time: load the board directly, as a reset client did
    /// before the topic carried boards.
    async fn reload_after_reset(&self, room: &RoomId) {
        if !self.store.is_resetting().await {
            return;
        }
        warn!(
            room = %room,
            timeout = ?self.reset_confirmation_timeout,
            "actions: no reset broadcast in time, reloading board"
        );
        match self.api.board(room).await {
            Ok(board) => {
                if let Err(err) = self.store.apply_reset(board).await {
                    debug!(error = %err, "actions: room left before reset reload finished");
                    self.store.set_resetting(false).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "actions: board reload after reset failed");
                self.store.set_resetting(false).await;
                self.store
                    .set_error(Some(ActionError::unavailable(ActionKind::Reset).user_message()))
                    .await;
            }
        }
    }

    /// The action task died before settling; clear everything it owned.
    async fn recover(&self, kind: ActionKind, err: tokio::task::JoinError) -> ActionError {
        error!(action = %kind, error = %err, "actions: action task aborted");
        let mapped = ActionError::unavailable(kind);
        self.store.set_processing(false).await;
        if kind == ActionKind::Reset {
            self.store.set_resetting(false).await;
        }
        self.store.set_error(Some(mapped.user_message())).await;
        self.release().await;
        mapped
    }
}

pub(crate) fn map_api_error(kind: ActionKind, err: &ApiCallError) -> ActionError {
    match err {
        ApiCallError::Status(exception) => match exception.code {
            ErrorCode::Validation | ErrorCode::Conflict => ActionError::invalid_move(kind),
            ErrorCode::NotFound => ActionError::not_found(kind),
            _ => match &exception.message {
                Some(message) => ActionError::Rejected {
                    status: exception.status,
                    message: message.clone(),
                },
                None => ActionError::unavailable(kind),
            },
        },
        ApiCallError::Credential(CredentialError::Unauthenticated) => ActionError::not_logged_in(),
        ApiCallError::Credential(_) | ApiCallError::Network(_) | ApiCallError::Decode(_) => {
            ActionError::unavailable(kind)
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
