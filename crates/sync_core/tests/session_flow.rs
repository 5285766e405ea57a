use std::{sync::Arc, time::Duration};

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{ActorId, Coord, RoomId};
use sync_core::{
    error::DecodeError,
    stomp::{self, Command, Frame, Incoming},
    transport::memory::{MemoryConnector, MemoryPeer},
    ActionStatus, Credential, Diagnostic, GameSession, HttpActionApi, SessionContext,
    SessionError, StaticCredentials, SyncConfig,
};
use tokio::{net::TcpListener, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn world(Path(slug): Path<String>) -> Result<Json<Value>, StatusCode> {
    if slug != "alpha" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "id": "w-1",
        "slug": slug,
        "name": "Alpha",
        "boardSize": 2,
        "maxPlayers": 4
    })))
}

async fn board() -> Json<Value> {
    Json(json!([
        {"x": 0, "y": 0, "ownerId": null, "defenseBonus": 0},
        {"x": 1, "y": 0, "ownerId": null, "defenseBonus": 0},
        {"x": 0, "y": 1, "ownerId": null, "defenseBonus": 0},
        {"x": 1, "y": 1, "ownerId": null, "defenseBonus": 0}
    ]))
}

async fn capture(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "x": body["x"],
        "y": body["y"],
        "ownerId": body["actorId"],
        "defenseBonus": 0
    }))
}

async fn spawn_game_server() -> SyncConfig {
    let app = Router::new()
        .route("/api/worlds/:slug", get(world))
        .route("/api/worlds/:slug/board", get(board))
        .route("/api/worlds/:slug/actions/capture", post(capture));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    SyncConfig::parse(&format!("http://{addr}"))
        .expect("config")
        .with_reconnect_delay(Duration::from_millis(20))
        .with_heartbeat(Duration::ZERO, Duration::ZERO)
        .with_shutdown_timeout(Duration::from_millis(200))
}

async fn join(
    config: SyncConfig,
    slug: &str,
) -> (Result<GameSession, SessionError>, MemoryConnector, tokio::sync::mpsc::UnboundedReceiver<MemoryPeer>) {
    let credentials = Arc::new(StaticCredentials(Credential::bearer("tok")));
    let api = Arc::new(HttpActionApi::new(&config, credentials.clone()).expect("api"));
    let (connector, peers) = MemoryConnector::new();
    let session = GameSession::join_with(
        config,
        SessionContext::new(Some(ActorId::new("me")), RoomId::new(slug)),
        api,
        credentials,
        Arc::new(connector.clone()),
    )
    .await;
    (session, connector, peers)
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    loop {
        let text = timeout(WAIT, peer.recv())
            .await
            .expect("frame in time")
            .expect("client connected");
        for incoming in stomp::decode(&text).expect("valid stomp") {
            if let Incoming::Frame(frame) = incoming {
                return frame;
            }
        }
    }
}

fn room_message(body: &str) -> String {
    Frame::new(Command::Message)
        .header("subscription", "sub-0")
        .header("destination", "/topic/worlds/alpha")
        .body(body)
        .encode()
}

#[tokio::test]
async fn joined_session_applies_broadcasts_and_actions() {
    let config = spawn_game_server().await;
    let (session, _connector, mut peers) = join(config, "alpha").await;
    let session = session.expect("join");
    let store = session.store();
    let mut diagnostics = session.diagnostics();

    let mut peer = timeout(WAIT, peers.recv())
        .await
        .expect("connect attempt")
        .expect("peer");
    assert_eq!(next_frame(&mut peer).await.command, Command::Connect);
    peer.send(
        Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", "0,0")
            .encode(),
    );
    let subscribe = next_frame(&mut peer).await;
    assert_eq!(subscribe.get("destination"), Some("/topic/worlds/alpha"));
    assert_eq!(store.board().await.len(), 4);

    peer.send(room_message(
        r#"{"type":"SQUARE_CAPTURED","board":[
            {"x":0,"y":0,"ownerId":"them","defenseBonus":5},
            {"x":1,"y":0,"ownerId":null,"defenseBonus":0},
            {"x":0,"y":1,"ownerId":null,"defenseBonus":0},
            {"x":1,"y":1,"ownerId":null,"defenseBonus":0}
        ],"actorId":"them"}"#,
    ));
    timeout(WAIT, async {
        loop {
            let cell = store.cell(Coord::new(0, 0)).await.expect("cell");
            if cell.owner_id == Some(ActorId::new("them")) {
                assert_eq!(cell.defense_bonus, 3);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broadcast applied");

    assert_eq!(
        session.capture(Coord::new(1, 0)).await,
        Ok(ActionStatus::Confirmed)
    );
    assert_eq!(
        store
            .cell(Coord::new(1, 0))
            .await
            .and_then(|cell| cell.owner_id),
        Some(ActorId::new("me"))
    );

    peer.send(room_message("{\"type\":"));
    let diagnostic = timeout(WAIT, diagnostics.recv())
        .await
        .expect("diagnostic in time")
        .expect("diagnostics open");
    assert!(matches!(
        diagnostic,
        Diagnostic::DecodeFailed(DecodeError::Malformed(_))
    ));

    session.leave().await;
    assert_eq!(next_frame(&mut peer).await.command, Command::Unsubscribe);
    assert_eq!(next_frame(&mut peer).await.command, Command::Disconnect);
    assert_eq!(store.room().await, None);
    assert!(!session.connection_status().is_connected());

    session.leave().await;
}

#[tokio::test]
async fn unknown_room_fails_to_join() {
    let config = spawn_game_server().await;
    let (session, _connector, _peers) = join(config, "nowhere").await;

    assert!(matches!(session, Err(SessionError::Load(_))));
}
