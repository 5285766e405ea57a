use super::*;
use async_trait::async_trait;
use shared::{
    domain::{Coord, RoomId, WorldId, WorldMeta},
    protocol::{ActionResponse, CellActionRequest, ResetRequest},
};

use crate::api::ApiCallError;

/// Serves only `GET board`; every fetch is recorded.
struct BoardOnlyApi {
    board: Result<BoardSnapshot, ApiCallError>,
    fetched: std::sync::Mutex<Vec<RoomId>>,
}

impl BoardOnlyApi {
    fn new(board: Result<BoardSnapshot, ApiCallError>) -> Arc<Self> {
        Arc::new(Self {
            board,
            fetched: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ActionApi for BoardOnlyApi {
    async fn capture(
        &self,
        _room: &RoomId,
        _request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError> {
        Err(ApiCallError::Network("unused".into()))
    }

    async fn defend(
        &self,
        _room: &RoomId,
        _request: CellActionRequest,
    ) -> Result<ActionResponse, ApiCallError> {
        Err(ApiCallError::Network("unused".into()))
    }

    async fn reset(&self, _room: &RoomId, _request: ResetRequest) -> Result<(), ApiCallError> {
        Err(ApiCallError::Network("unused".into()))
    }

    async fn board(&self, room: &RoomId) -> Result<BoardSnapshot, ApiCallError> {
        self.fetched.lock().expect("fetch log").push(room.clone());
        self.board.clone()
    }

    async fn world(&self, _room: &RoomId) -> Result<WorldMeta, ApiCallError> {
        Err(ApiCallError::Network("unused".into()))
    }
}

fn world() -> WorldMeta {
    WorldMeta {
        id: WorldId::new("w-1"),
        slug: RoomId::new("alpha"),
        name: "Alpha".into(),
        owner: None,
        board_size: 2,
        max_players: Some(4),
        max_teams: None,
        allow_player_team_creation: false,
    }
}

fn board_json(owner: Option<&str>) -> String {
    let owner = owner.map_or("null".to_string(), |id| format!("\"{id}\""));
    format!(
        r#"[{{"x":0,"y":0,"ownerId":{owner},"defenseBonus":0}},{{"x":1,"y":0,"ownerId":null,"defenseBonus":0}}]"#
    )
}

fn event(kind: &str, owner: Option<&str>, actor: &str) -> String {
    format!(
        r#"{{"type":"{kind}","board":{},"actorId":"{actor}","timestamp":1700000000000}}"#,
        board_json(owner)
    )
}

async fn setup(local_actor: Option<&str>) -> (Arc<BoardStore>, Dispatcher, broadcast::Receiver<Diagnostic>) {
    let store = Arc::new(BoardStore::new(3));
    store.load(world(), BoardSnapshot::empty(2, 1)).await;
    let (diagnostics, rx) = broadcast::channel(16);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        local_actor.map(ActorId::new),
        diagnostics,
    );
    (store, dispatcher, rx)
}

#[test]
fn decode_accepts_board_events_and_legacy_squares() {
    let captured = decode(&event("SQUARE_CAPTURED", Some("a"), "a")).expect("board event");
    assert_eq!(captured.kind, InboundKind::SquareCaptured);
    assert!(matches!(captured.payload, EventPayload::Board(ref board) if board.len() == 2));
    assert_eq!(captured.originating_actor, Some(ActorId::new("a")));
    assert!(captured.timestamp.is_some());

    let legacy = decode(
        r#"{"type":"SQUARE_DEFENDED","square":{"x":1,"y":0,"owner":{"id":"b"},"defenseBonus":2},"playerId":"b"}"#,
    )
    .expect("square event");
    match legacy.payload {
        EventPayload::Cell(cell) => {
            assert_eq!(cell.coord(), Coord::new(1, 0));
            assert_eq!(cell.defense_bonus, 2);
        }
        other => panic!("expected a cell payload, got {other:?}"),
    }
}

#[test]
fn decode_rejects_unknown_tags_and_missing_payloads() {
    assert_eq!(
        decode(r#"{"type":"PLAYER_JOINED","board":[]}"#),
        Err(DecodeError::UnknownKind("PLAYER_JOINED".into()))
    );
    assert_eq!(
        decode(r#"{"type":"SQUARE_CAPTURED","square":null}"#),
        Err(DecodeError::MissingPayload("SQUARE_CAPTURED".into()))
    );
    assert!(matches!(
        decode("not json at all"),
        Err(DecodeError::Malformed(_))
    ));
}

#[tokio::test]
async fn events_apply_in_arrival_order() {
    let (store, dispatcher, _diagnostics) = setup(None).await;

    dispatcher.dispatch(&event("SQUARE_CAPTURED", Some("a"), "a")).await;
    dispatcher.dispatch(&event("SQUARE_CAPTURED", Some("b"), "b")).await;
    let last = dispatcher.dispatch(&event("SQUARE_DEFENDED", Some("c"), "c")).await;

    assert!(matches!(
        last,
        Dispatched::Applied {
            kind: InboundKind::SquareDefended,
            ..
        }
    ));
    let owner = store
        .cell(Coord::new(0, 0))
        .await
        .and_then(|cell| cell.owner_id);
    assert_eq!(owner, Some(ActorId::new("c")));
}

#[tokio::test]
async fn queued_events_drain_in_order_through_run() {
    let (store, dispatcher, _diagnostics) = setup(None).await;
    let (tx, rx) = mpsc::channel(8);
    for owner in ["a", "b", "c"] {
        tx.send(event("SQUARE_CAPTURED", Some(owner), owner))
            .await
            .expect("queue");
    }
    drop(tx);

    dispatcher.run(rx).await;

    let owner = store
        .cell(Coord::new(0, 0))
        .await
        .and_then(|cell| cell.owner_id);
    assert_eq!(owner, Some(ActorId::new("c")));
}

#[tokio::test]
async fn malformed_payload_reports_once_and_leaves_store_untouched() {
    let (store, dispatcher, mut diagnostics) = setup(None).await;
    let before = store.view().await;

    let outcome = dispatcher.dispatch(r#"{"type":"SQUARE_CAPTURED","board":"#).await;

    assert_eq!(outcome, Dispatched::Dropped);
    assert!(matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::DecodeFailed(DecodeError::Malformed(_)))
    ));
    assert!(diagnostics.try_recv().is_err());
    assert_eq!(store.view().await, before);
}

#[tokio::test]
async fn world_reset_clears_resetting_flag() {
    let (store, dispatcher, _diagnostics) = setup(Some("me")).await;
    store.set_resetting(true).await;

    let outcome = dispatcher.dispatch(&event("WORLD_RESET", None, "me")).await;

    assert!(matches!(
        outcome,
        Dispatched::Applied {
            kind: InboundKind::WorldReset,
            self_origin: true,
            ..
        }
    ));
    assert!(!store.is_resetting().await);
}

#[tokio::test]
async fn self_origin_events_are_applied() {
    let (store, dispatcher, _diagnostics) = setup(Some("me")).await;

    dispatcher.dispatch(&event("SQUARE_CAPTURED", Some("me"), "me")).await;

    let owner = store
        .cell(Coord::new(0, 0))
        .await
        .and_then(|cell| cell.owner_id);
    assert_eq!(owner, Some(ActorId::new("me")));
}

#[tokio::test]
async fn events_after_leave_are_reported_not_applied() {
    let (store, dispatcher, mut diagnostics) = setup(None).await;
    store.reset().await;

    let outcome = dispatcher.dispatch(&event("SQUARE_CAPTURED", Some("a"), "a")).await;

    assert_eq!(outcome, Dispatched::Dropped);
    assert_eq!(
        diagnostics.try_recv(),
        Ok(Diagnostic::StoreRejected {
            kind: InboundKind::SquareCaptured,
            error: StoreError::NotLoaded,
        })
    );
    assert!(store.board().await.is_empty());
}

#[test]
fn boardless_reset_decodes_as_reload() {
    let event = decode(r#"{"type":"WORLD_RESET","square":null,"playerId":"other","timestamp":1700000000000}"#)
        .expect("legacy reset");
    assert_eq!(event.kind, InboundKind::WorldReset);
    assert_eq!(event.payload, EventPayload::ReloadRequired);
    assert_eq!(event.originating_actor, Some(ActorId::new("other")));
}

#[tokio::test]
async fn fractional_timestamp_does_not_drop_the_board() {
    let (store, dispatcher, mut diagnostics) = setup(None).await;
    let raw = format!(
        r#"{{"type":"SQUARE_CAPTURED","board":{},"actorId":"b","timestamp":1700000000.125}}"#,
        board_json(Some("b"))
    );

    let outcome = dispatcher.dispatch(&raw).await;

    assert!(matches!(outcome, Dispatched::Applied { .. }));
    assert!(diagnostics.try_recv().is_err());
    let owner = store
        .cell(Coord::new(0, 0))
        .await
        .and_then(|cell| cell.owner_id);
    assert_eq!(owner, Some(ActorId::new("b")));
}

#[tokio::test]
async fn boardless_reset_reloads_the_board() {
    let (store, dispatcher, mut diagnostics) = setup(None).await;
    store
        .upsert_cell(Cell::new(0, 0).with_owner(Some(ActorId::new("a"))))
        .await
        .expect("seed");
    store.set_resetting(true).await;
    let api = BoardOnlyApi::new(Ok(BoardSnapshot::empty(2, 1)));
    let dispatcher = dispatcher.with_board_source(api.clone());

    let outcome = dispatcher
        .dispatch(r#"{"type":"WORLD_RESET","square":null,"playerId":"other"}"#)
        .await;

    assert!(matches!(
        outcome,
        Dispatched::Applied {
            kind: InboundKind::WorldReset,
            self_origin: false,
            ..
        }
    ));
    assert_eq!(*api.fetched.lock().expect("fetch log"), vec![RoomId::new("alpha")]);
    assert_eq!(store.cell(Coord::new(0, 0)).await, Some(Cell::new(0, 0)));
    assert!(!store.is_resetting().await);
    assert!(diagnostics.try_recv().is_err());
}

#[tokio::test]
async fn failed_reload_is_reported_and_keeps_the_board() {
    let (store, dispatcher, mut diagnostics) = setup(None).await;
    let api = BoardOnlyApi::new(Err(ApiCallError::Network("connection refused".into())));
    let dispatcher = dispatcher.with_board_source(api);
    let before = store.view().await;

    let outcome = dispatcher.dispatch(r#"{"type":"WORLD_RESET"}"#).await;

    assert_eq!(outcome, Dispatched::Dropped);
    assert!(matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::ReloadFailed(reason)) if reason.contains("connection refused")
    ));
    assert_eq!(store.view().await, before);
}
