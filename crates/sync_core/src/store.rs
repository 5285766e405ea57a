use shared::domain::{BoardSnapshot, Cell, Coord, RoomId, WorldMeta};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::StoreError;

const STORE_EVENT_CAPACITY: usize = 1024;

/// Change notification for presentation. Readers re-read the store on
/// receipt; events carry no state they could apply out of order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Loaded { room: RoomId },
    BoardReplaced { revision: u64 },
    CellUpdated { revision: u64, cell: Cell },
    ProcessingChanged(bool),
    ResettingChanged(bool),
    ErrorChanged(Option<String>),
    Cleared,
}

/// Consistent copy of everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreView {
    pub world: Option<WorldMeta>,
    pub board: BoardSnapshot,
    /// Bumped on every board mutation.
    pub revision: u64,
    pub processing: bool,
    pub resetting: bool,
    pub error: Option<String>,
}

impl StoreView {
    pub fn room(&self) -> Option<&RoomId> {
        self.world.as_ref().map(|world| &world.slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub previous: Cell,
    pub revision: u64,
}

/// Result of a read-modify-write on one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modified {
    pub original: Cell,
    pub updated: Cell,
    pub revision: u64,
}

/// Canonical board state for one room session.
///
/// Every mutation happens under one write lock, so a reader sees a board
/// either entirely before or entirely after a replacement.
pub struct BoardStore {
    inner: RwLock<StoreView>,
    events: broadcast::Sender<StoreEvent>,
    max_defense_bonus: u32,
}

impl BoardStore {
    pub fn new(max_defense_bonus: u32) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            inner: RwLock::new(StoreView::default()),
            events,
            max_defense_bonus,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// Installs the room joined by the session; clears transient flags.
    pub async fn load(&self, world: WorldMeta, board: BoardSnapshot) {
        let room = world.slug.clone();
        {
            let mut guard = self.inner.write().await;
            let revision = guard.revision + 1;
            *guard = StoreView {
                world: Some(world),
                board: board.clamped(self.max_defense_bonus),
                revision,
                processing: false,
                resetting: false,
                error: None,
            };
        }
        debug!(room = %room, "store: room loaded");
        self.emit(StoreEvent::Loaded { room });
    }

    pub async fn replace_board(&self, snapshot: BoardSnapshot) -> Result<u64, StoreError> {
        let revision = {
            let mut guard = self.inner.write().await;
            if guard.world.is_none() {
                return Err(StoreError::NotLoaded);
            }
            guard.board = snapshot.clamped(self.max_defense_bonus);
            guard.revision += 1;
            guard.revision
        };
        self.emit(StoreEvent::BoardReplaced { revision });
        Ok(revision)
    }

    /// Replaces the board and clears `resetting` in the same critical section.
    pub async fn apply_reset(&self, snapshot: BoardSnapshot) -> Result<u64, StoreError> {
        let (revision, was_resetting) = {
            let mut guard = self.inner.write().await;
            if guard.world.is_none() {
                return Err(StoreError::NotLoaded);
            }
            guard.board = snapshot.clamped(self.max_defense_bonus);
            guard.revision += 1;
            let was_resetting = std::mem::replace(&mut guard.resetting, false);
            (guard.revision, was_resetting)
        };
        self.emit(StoreEvent::BoardReplaced { revision });
        if was_resetting {
            self.emit(StoreEvent::ResettingChanged(false));
        }
        Ok(revision)
    }

    /// Overwrites the cell with the same coordinates. Unknown coordinates are
    /// reported, never inserted: the cell set is fixed when the room is joined.
    pub async fn upsert_cell(&self, cell: Cell) -> Result<Upserted, StoreError> {
        let cell = cell.clamped(self.max_defense_bonus);
        let (previous, revision) = {
            let mut guard = self.inner.write().await;
            if guard.world.is_none() {
                return Err(StoreError::NotLoaded);
            }
            let Some(previous) = guard.board.replace_cell(cell.clone()) else {
                warn!(x = cell.x, y = cell.y, "store: upsert for a cell outside the loaded board");
                return Err(StoreError::UnknownCell(cell.coord()));
            };
            guard.revision += 1;
            (previous, guard.revision)
        };
        self.emit(StoreEvent::CellUpdated { revision, cell });
        Ok(Upserted { previous, revision })
    }

    /// Derives the new cell from the current one under a single write lock,
    /// so nothing applied concurrently is overwritten with a stale base.
    pub async fn modify_cell<F>(&self, coord: Coord, update: F) -> Result<Modified, StoreError>
    where
        F: FnOnce(&Cell) -> Cell,
    {
        let modified = {
            let mut guard = self.inner.write().await;
            if guard.world.is_none() {
                return Err(StoreError::NotLoaded);
            }
            let Some(original) = guard.board.get(coord).cloned() else {
                return Err(StoreError::UnknownCell(coord));
            };
            let mut updated = update(&original).clamped(self.max_defense_bonus);
            updated.x = coord.x;
            updated.y = coord.y;
            guard.board.replace_cell(updated.clone());
            guard.revision += 1;
            Modified {
                original,
                updated,
                revision: guard.revision,
            }
        };
        self.emit(StoreEvent::CellUpdated {
            revision: modified.revision,
            cell: modified.updated.clone(),
        });
        Ok(modified)
    }

    /// Puts `original` back only while the cell still equals `predicted`.
    /// Returns whether the rollback happened.
    pub async fn restore_cell_if(&self, predicted: &Cell, original: Cell) -> bool {
        let revision = {
            let mut guard = self.inner.write().await;
            if guard.board.get(predicted.coord()) != Some(predicted) {
                return false;
            }
            guard.board.replace_cell(original.clone());
            guard.revision += 1;
            guard.revision
        };
        self.emit(StoreEvent::CellUpdated {
            revision,
            cell: original,
        });
        true
    }

    pub async fn set_processing(&self, processing: bool) {
        let changed = {
            let mut guard = self.inner.write().await;
            std::mem::replace(&mut guard.processing, processing) != processing
        };
        if changed {
            self.emit(StoreEvent::ProcessingChanged(processing));
        }
    }

    pub async fn set_resetting(&self, resetting: bool) {
        let changed = {
            let mut guard = self.inner.write().await;
            std::mem::replace(&mut guard.resetting, resetting) != resetting
        };
        if changed {
            self.emit(StoreEvent::ResettingChanged(resetting));
        }
    }

    pub async fn set_error(&self, message: Option<String>) {
        let changed = {
            let mut guard = self.inner.write().await;
            if guard.error == message {
                false
            } else {
                guard.error = message.clone();
                true
            }
        };
        if changed {
            self.emit(StoreEvent::ErrorChanged(message));
        }
    }

    pub async fn clear_error(&self) {
        self.set_error(None).await;
    }

    /// Discards the room: board, world and every flag.
    pub async fn reset(&self) {
        *self.inner.write().await = StoreView::default();
        self.emit(StoreEvent::Cleared);
    }

    pub async fn view(&self) -> StoreView {
        self.inner.read().await.clone()
    }

    pub async fn board(&self) -> BoardSnapshot {
        self.inner.read().await.board.clone()
    }

    pub async fn cell(&self, coord: Coord) -> Option<Cell> {
        self.inner.read().await.board.get(coord).cloned()
    }

    pub async fn room(&self) -> Option<RoomId> {
        self.inner.read().await.room().cloned()
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.read().await.processing
    }

    pub async fn is_resetting(&self) -> bool {
        self.inner.read().await.resetting
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.read().await.error.clone()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
