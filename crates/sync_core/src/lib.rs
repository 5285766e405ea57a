use std::sync::Arc;

use shared::domain::{ActorId, Coord, RoomId};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod stomp;
pub mod store;
pub mod transport;

pub use api::{ActionApi, ApiCallError, HttpActionApi};
pub use auth::{AuthServiceCredentials, Credential, CredentialProvider, StaticCredentials};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use coordinator::{ActionCoordinator, ActionStatus, PendingAction};
pub use dispatch::{Diagnostic, Dispatcher};
pub use error::{ActionError, SessionError};
pub use store::{BoardStore, StoreEvent, StoreView};
pub use transport::{TransportConnector, WebSocketConnector};

const DIAGNOSTIC_CAPACITY: usize = 256;

/// Who is playing and where. Passed explicitly to every component that needs
/// it instead of living in process-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// `None` for spectators; mutating actions then fail with a precondition.
    pub local_actor: Option<ActorId>,
    pub room: RoomId,
}

impl SessionContext {
    pub fn new(local_actor: Option<ActorId>, room: RoomId) -> Self {
        Self { local_actor, room }
    }
}

/// One joined room: the store, the push channel feeding it through the
/// dispatcher, and the action coordinator writing to it.
pub struct GameSession {
    context: SessionContext,
    store: Arc<BoardStore>,
    connection: ConnectionManager,
    coordinator: ActionCoordinator,
    diagnostics: broadcast::Sender<Diagnostic>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl GameSession {
    /// Joins over HTTP and WebSocket.
    pub async fn join(
        config: SyncConfig,
        context: SessionContext,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SessionError> {
        let api = Arc::new(HttpActionApi::new(&config, Arc::clone(&credentials))?);
        Self::join_with(config, context, api, credentials, Arc::new(WebSocketConnector)).await
    }

    /// Joins with caller-supplied collaborators.
    ///
    /// The push channel is opened before the snapshot is fetched; anything it
    /// delivers meanwhile waits in the inbound queue and is applied on top of
    /// the snapshot.
    pub async fn join_with(
        config: SyncConfig,
        context: SessionContext,
        api: Arc<dyn ActionApi>,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self, SessionError> {
        let store = Arc::new(BoardStore::new(config.max_defense_bonus));
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        let coordinator = ActionCoordinator::new(
            context.clone(),
            Arc::clone(&api),
            Arc::clone(&store),
            config.reset_confirmation_timeout,
            config.max_defense_bonus,
        );
        let connection = ConnectionManager::new(config, credentials, connector);
        connection.open(context.room.clone()).await;

        let loaded = async {
            let world = api.world(&context.room).await?;
            let board = api.board(&context.room).await?;
            Ok::<_, ApiCallError>((world, board))
        }
        .await;
        let (world, board) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(room = %context.room, error = %err, "session: failed to load room");
                connection.close().await;
                return Err(SessionError::Load(err));
            }
        };
        info!(
            room = %context.room,
            world = %world.name,
            cells = board.len(),
            "session: room loaded"
        );
        store.load(world, board).await;

        let dispatcher = match connection.on_event().await {
            Some(inbound) => {
                let dispatcher = Dispatcher::new(
                    Arc::clone(&store),
                    context.local_actor.clone(),
                    diagnostics.clone(),
                )
                .with_board_source(Arc::clone(&api));
                Some(tokio::spawn(dispatcher.run(inbound)))
            }
            None => None,
        };

        Ok(Self {
            context,
            store,
            connection,
            coordinator,
            diagnostics,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn store(&self) -> Arc<BoardStore> {
        Arc::clone(&self.store)
    }

    pub fn coordinator(&self) -> &ActionCoordinator {
        &self.coordinator
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Decode failures and dropped events, for display next to the
    /// connectivity indicator.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    pub async fn capture(&self, coord: Coord) -> Result<ActionStatus, ActionError> {
        self.coordinator.request_capture(coord).await
    }

    pub async fn defend(&self, coord: Coord) -> Result<ActionStatus, ActionError> {
        self.coordinator.request_defend(coord).await
    }

    pub async fn reset(&self) -> Result<ActionStatus, ActionError> {
        self.coordinator.request_reset().await
    }

    /// Closes the push channel, stops dispatching and discards the board.
    /// Safe to call more than once.
    pub async fn leave(&self) {
        self.connection.close().await;
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.abort();
        }
        self.store.reset().await;
        info!(room = %self.context.room, "session: left room");
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}
