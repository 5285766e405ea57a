//! Push-channel lifecycle: connect, authenticate, subscribe, heartbeat,
//! reconnect, close.
//!
//! Failures never reach callers. They move the state machine and are
//! published on [`ConnectionManager::watch_status`].

use std::{sync::Arc, time::Duration};

use shared::domain::RoomId;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::{
    auth::{Credential, CredentialProvider},
    config::SyncConfig,
    error::TransportError,
    stomp::{self, Command, Frame, HeartbeatOffer, Incoming, NegotiatedHeartbeat},
    transport::{Transport, TransportConnector},
};

const SUBSCRIPTION_ID: &str = "sub-0";
const DISCONNECT_RECEIPT: &str = "close-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub room: Option<RoomId>,
    /// Last transport problem; cleared once a subscription is established.
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    config: SyncConfig,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn TransportConnector>,
    status: watch::Sender<ConnectionStatus>,
    inbound_tx: mpsc::Sender<String>,
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    worker: Mutex<Option<Worker>>,
}

impl ConnectionManager {
    pub fn new(
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            room: None,
            last_error: None,
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        Self {
            config,
            credentials,
            connector,
            status,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            worker: Mutex::new(None),
        }
    }

    /// Hands out the single consumer end of the inbound queue: raw message
    /// bodies from the room topic, in transport arrival order. Returns `None`
    /// once taken.
    pub async fn on_event(&self) -> Option<mpsc::Receiver<String>> {
        self.inbound_rx.lock().await.take()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Starts the connection worker for `room`. No-op while a worker is
    /// already connecting, connected or waiting to reconnect.
    pub async fn open(&self, room: RoomId) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|active| !active.handle.is_finished()) {
            debug!(room = %room, "realtime: open ignored, channel already active");
            return;
        }

        let url = match self.config.resolved_realtime_url() {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, "realtime: cannot derive push channel url");
                self.status.send_modify(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.room = Some(room);
                    status.last_error = Some(err.to_string());
                });
                return;
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let link = Link {
            url,
            destination: format!("/topic/worlds/{room}"),
            credentials: Arc::clone(&self.credentials),
            connector: Arc::clone(&self.connector),
            inbound: self.inbound_tx.clone(),
            status: self.status.clone(),
            heartbeat: HeartbeatOffer {
                outgoing: self.config.heartbeat_outgoing,
                incoming: self.config.heartbeat_incoming,
            },
            handshake_timeout: self.config.handshake_timeout,
            reconnect_delay: self.config.reconnect_delay,
        };
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.room = Some(room.clone());
            status.last_error = None;
        });
        info!(room = %room, url = %link.url, "realtime: opening push channel");
        let handle = tokio::spawn(link.run(shutdown_rx));
        *worker = Some(Worker { shutdown, handle });
    }

    /// Unsubscribes, disconnects and stops the worker, cancelling pending
    /// reconnect and heartbeat timers. Safe to call any number of times.
    pub async fn close(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(Worker { shutdown, mut handle }) = worker {
            let _ = shutdown.send(true);
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "realtime: graceful close timed out, aborting worker"
                );
                handle.abort();
            }
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(worker) = worker.take() {
                worker.handle.abort();
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Fatal(TransportError),
    Dropped(TransportError),
}

enum HandshakeFailure {
    Rejected(TransportError),
    Transport(TransportError),
}

/// Everything one worker needs; owned by the spawned task.
struct Link {
    url: Url,
    destination: String,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn TransportConnector>,
    inbound: mpsc::Sender<String>,
    status: watch::Sender<ConnectionStatus>,
    heartbeat: HeartbeatOffer,
    handshake_timeout: Duration,
    reconnect_delay: Duration,
}

impl Link {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.run_session(&mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Fatal(err) => {
                    error!(error = %err, "realtime: fatal handshake failure, giving up");
                    self.report(ConnectionState::Disconnected, &err);
                    return;
                }
                SessionEnd::Dropped(err) => {
                    warn!(
                        error = %err,
                        delay = ?self.reconnect_delay,
                        "realtime: connection lost, reconnecting"
                    );
                    self.report(ConnectionState::Reconnecting, &err);
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("realtime: worker stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if state == ConnectionState::Connected {
                status.last_error = None;
            }
        });
    }

    fn report(&self, state: ConnectionState, err: &TransportError) {
        self.status.send_modify(|status| {
            status.state = state;
            status.last_error = Some(err.to_string());
        });
    }

    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        // Fresh credential for every attempt.
        let credential = tokio::select! {
            result = self.credentials.fetch_credential() => match result {
                Ok(credential) => credential,
                Err(err) => return SessionEnd::Dropped(TransportError::Credential(err.to_string())),
            },
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
        };

        let mut transport = tokio::select! {
            result = self.connector.connect(&self.url) => match result {
                Ok(transport) => transport,
                Err(err) => return SessionEnd::Dropped(err),
            },
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
        };

        let handshake = tokio::select! {
            result = self.handshake(transport.as_mut(), &credential) => Some(result),
            _ = shutdown_requested(shutdown) => None,
        };
        let heartbeat = match handshake {
            None => {
                let _ = transport.close().await;
                return SessionEnd::Shutdown;
            }
            Some(Ok(heartbeat)) => heartbeat,
            Some(Err(HandshakeFailure::Rejected(err))) => {
                let _ = transport.close().await;
                return SessionEnd::Fatal(err);
            }
            Some(Err(HandshakeFailure::Transport(err))) => {
                let _ = transport.close().await;
                return SessionEnd::Dropped(err);
            }
        };

        let subscribe = Frame::subscribe(SUBSCRIPTION_ID, &self.destination).encode();
        if let Err(err) = transport.send(subscribe).await {
            let _ = transport.close().await;
            return SessionEnd::Dropped(err);
        }
        self.set_state(ConnectionState::Connected);
        info!(
            destination = %self.destination,
            outgoing = ?heartbeat.outgoing,
            incoming = ?heartbeat.incoming,
            "realtime: subscribed"
        );

        let end = self.pump(transport.as_mut(), heartbeat, shutdown).await;
        if matches!(end, SessionEnd::Shutdown) {
            self.leave(transport.as_mut()).await;
        }
        let _ = transport.close().await;
        end
    }

    async fn handshake(
        &self,
        transport: &mut dyn Transport,
        credential: &Credential,
    ) -> Result<NegotiatedHeartbeat, HandshakeFailure> {
        let host = self.url.host_str().unwrap_or("localhost");
        let connect = Frame::connect(host, credential.bearer_token.as_deref(), self.heartbeat);
        transport
            .send(connect.encode())
            .await
            .map_err(HandshakeFailure::Transport)?;

        let offer = self.heartbeat;
        let wait = async {
            loop {
                let text = match transport.recv().await {
                    Some(Ok(text)) => text,
                    Some(Err(err)) => return Err(HandshakeFailure::Transport(err)),
                    None => return Err(HandshakeFailure::Transport(TransportError::ClosedByServer)),
                };
                let frames = match stomp::decode(&text) {
                    Ok(frames) => frames,
                    Err(err) => return Err(HandshakeFailure::Transport(err)),
                };
                for incoming in frames {
                    let Incoming::Frame(frame) = incoming else {
                        continue;
                    };
                    match frame.command {
                        Command::Connected => return Ok(offer.negotiate(frame.get("heart-beat"))),
                        Command::Error => {
                            return Err(HandshakeFailure::Rejected(
                                TransportError::HandshakeRejected(error_text(&frame)),
                            ))
                        }
                        other => debug!(command = ?other, "realtime: ignoring frame before CONNECTED"),
                    }
                }
            }
        };

        match tokio::time::timeout(self.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeFailure::Transport(
                TransportError::HandshakeTimeout(self.handshake_timeout),
            )),
        }
    }

    async fn pump(
        &self,
        transport: &mut dyn Transport,
        heartbeat: NegotiatedHeartbeat,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut outgoing = heartbeat.outgoing.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let silence_limit = heartbeat.incoming_deadline();
        let mut last_seen = Instant::now();

        loop {
            let watchdog_at = silence_limit.map(|limit| last_seen + limit);
            tokio::select! {
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                _ = sleep_until_or_pending(watchdog_at) => {
                    let limit = silence_limit.unwrap_or_default();
                    return SessionEnd::Dropped(TransportError::HeartbeatMissed(limit));
                }
                _ = tick_or_pending(&mut outgoing) => {
                    trace!("realtime: sending heartbeat");
                    if let Err(err) = transport.send(stomp::HEARTBEAT_FRAME.to_string()).await {
                        return SessionEnd::Dropped(err);
                    }
                }
                incoming = transport.recv() => {
                    let text = match incoming {
                        Some(Ok(text)) => text,
                        Some(Err(err)) => return SessionEnd::Dropped(err),
                        None => return SessionEnd::Dropped(TransportError::ClosedByServer),
                    };
                    last_seen = Instant::now();
                    if let Some(end) = self.forward(&text, shutdown).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Pushes MESSAGE bodies onto the inbound queue in arrival order.
    async fn forward(&self, text: &str, shutdown: &mut watch::Receiver<bool>) -> Option<SessionEnd> {
        let frames = match stomp::decode(text) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(error = %err, "realtime: skipping malformed frame");
                return None;
            }
        };
        for incoming in frames {
            let frame = match incoming {
                Incoming::Heartbeat => {
                    trace!("realtime: heartbeat received");
                    continue;
                }
                Incoming::Frame(frame) => frame,
            };
            match frame.command {
                Command::Message => {
                    if frame
                        .get("subscription")
                        .is_some_and(|id| id != SUBSCRIPTION_ID)
                    {
                        debug!("realtime: ignoring message for a foreign subscription");
                        continue;
                    }
                    tokio::select! {
                        sent = self.inbound.send(frame.body) => {
                            if sent.is_err() {
                                debug!("realtime: inbound consumer gone, dropping message");
                            }
                        }
                        _ = shutdown_requested(shutdown) => return Some(SessionEnd::Shutdown),
                    }
                }
                Command::Error => {
                    return Some(SessionEnd::Dropped(TransportError::ServerError(
                        error_text(&frame),
                    )))
                }
                other => debug!(command = ?other, "realtime: ignoring frame"),
            }
        }
        None
    }

    async fn leave(&self, transport: &mut dyn Transport) {
        if let Err(err) = transport
            .send(Frame::unsubscribe(SUBSCRIPTION_ID).encode())
            .await
        {
            debug!(error = %err, "realtime: unsubscribe failed during close");
            return;
        }
        if let Err(err) = transport
            .send(Frame::disconnect(DISCONNECT_RECEIPT).encode())
            .await
        {
            debug!(error = %err, "realtime: disconnect failed during close");
        }
    }
}

fn error_text(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| frame.body.trim().to_string())
}

/// Resolves once shutdown is requested or the manager is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_or_pending(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
