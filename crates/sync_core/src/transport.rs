//! Text-message transports the connection manager runs STOMP over.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// A connected, ordered, bidirectional text channel.
///
/// `recv` must be cancel-safe: the connection loop polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => {
                        return Some(Err(TransportError::Receive(format!(
                            "binary frame is not utf-8: {err}"
                        ))))
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(TransportError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("realtime: closing websocket");
        self.stream
            .close(None)
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }
}

/// In-process transport pair for embedding and tests.
pub mod memory {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    /// Server end of an in-memory connection.
    pub struct MemoryPeer {
        pub url: Url,
        to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MemoryPeer {
        pub fn send(&self, text: impl Into<String>) -> bool {
            self.to_client.send(Ok(text.into())).is_ok()
        }

        pub fn fail(&self, err: TransportError) -> bool {
            self.to_client.send(Err(err)).is_ok()
        }

        pub async fn recv(&mut self) -> Option<String> {
            self.from_client.recv().await
        }

        /// Drops the server side; the client observes a closed channel.
        pub fn hang_up(self) {}
    }

    pub struct MemoryTransport {
        inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.outbound
                .send(text)
                .map_err(|_| TransportError::Send("peer hung up".into()))
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.inbound.recv().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.inbound.close();
            Ok(())
        }
    }

    pub fn pair(url: Url) -> (MemoryTransport, MemoryPeer) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        (
            MemoryTransport { inbound, outbound },
            MemoryPeer {
                url,
                to_client,
                from_client,
            },
        )
    }

    /// Hands each accepted connection's server end to the receiver returned
    /// by [`MemoryConnector::new`]. Queued refusals are consumed first.
    #[derive(Clone)]
    pub struct MemoryConnector {
        peers: mpsc::UnboundedSender<MemoryPeer>,
        refusals: Arc<Mutex<Vec<TransportError>>>,
        attempts: Arc<Mutex<u32>>,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            (
                Self {
                    peers,
                    refusals: Arc::new(Mutex::new(Vec::new())),
                    attempts: Arc::new(Mutex::new(0)),
                },
                rx,
            )
        }

        pub async fn refuse_next(&self, err: TransportError) {
            self.refusals.lock().await.push(err);
        }

        pub async fn attempts(&self) -> u32 {
            *self.attempts.lock().await
        }
    }

    #[async_trait]
    impl TransportConnector for MemoryConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
            *self.attempts.lock().await += 1;
            {
                let mut refusals = self.refusals.lock().await;
                if !refusals.is_empty() {
                    return Err(refusals.remove(0));
                }
            }
            let (transport, peer) = pair(url.clone());
            self.peers
                .send(peer)
                .map_err(|_| TransportError::Connect {
                    url: url.to_string(),
                    reason: "no listener".into(),
                })?;
            Ok(Box::new(transport))
        }
    }
}
