//! Pairing transports
//!
//! A transport turns a [`ConnectionString`] into a [`PairingLink`]: a pair
//! of channels carrying [`PairingMessage`]s. The websocket pumps live on
//! their own tasks and close the inbound channel when the socket ends.

use super::connection_string::ConnectionString;
use super::{PairingMessage, TransportKind};
use crate::error::WalletError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct PairingLink {
    pub outbound: mpsc::UnboundedSender<PairingMessage>,
    pub inbound: mpsc::UnboundedReceiver<PairingMessage>,
}

impl PairingLink {
    /// Two in-memory ends wired to each other
    pub fn pair() -> (PairingLink, PairingLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PairingLink {
                outbound: a_tx,
                inbound: b_rx,
            },
            PairingLink {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait PairingTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, conn: &ConnectionString) -> Result<PairingLink, WalletError>;
}

/// The strategy chain, tried direct first
#[derive(Clone)]
pub struct PairingTransports {
    pub direct: Arc<dyn PairingTransport>,
    pub relay: Arc<dyn PairingTransport>,
}

impl Default for PairingTransports {
    fn default() -> Self {
        Self {
            direct: Arc::new(DirectTransport::default()),
            relay: Arc::new(RelayTransport::default()),
        }
    }
}

/// Websocket server on the advertised direct address. The device on the
/// local network connects in; the first one to complete the websocket
/// handshake gets the link.
pub struct DirectTransport {
    pub accept_timeout: Duration,
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self {
            accept_timeout: DEFAULT_DIRECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl PairingTransport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn open(&self, conn: &ConnectionString) -> Result<PairingLink, WalletError> {
        let url = conn
            .direct
            .as_ref()
            .ok_or_else(|| WalletError::Configuration("pairing string has no direct address".to_string()))?;

        let addrs = url
            .socket_addrs(|| Some(80))
            .map_err(|e| WalletError::Network(format!("cannot resolve {}: {}", url, e)))?;
        let addr = addrs
            .first()
            .copied()
            .ok_or_else(|| WalletError::Network(format!("no address for {}", url)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WalletError::Network(format!("cannot listen on {}: {}", addr, e)))?;
        log::info!("Waiting for the paired device on {}", addr);

        let (stream, peer) = tokio::time::timeout(self.accept_timeout, listener.accept())
            .await
            .map_err(|_| WalletError::Network(format!("no device connected to {} in time", addr)))?
            .map_err(|e| WalletError::Network(format!("accept on {} failed: {}", addr, e)))?;
        drop(listener);

        let ws = tokio::time::timeout(self.accept_timeout, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| WalletError::Network(format!("websocket handshake with {} timed out", peer)))?
            .map_err(|e| WalletError::Network(format!("websocket handshake with {} failed: {}", peer, e)))?;

        log::info!("Direct pairing link open from {}", peer);
        Ok(spawn_pumps(ws))
    }
}

/// Websocket through the wormhole relay, keyed by the wormhole code
pub struct RelayTransport {
    pub connect_timeout: Duration,
}

impl Default for RelayTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

#[async_trait]
impl PairingTransport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relayed
    }

    async fn open(&self, conn: &ConnectionString) -> Result<PairingLink, WalletError> {
        let url = conn
            .relay_url()
            .ok_or_else(|| WalletError::Configuration("pairing string has no relay address".to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let (ws, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| WalletError::Network(format!("relay {} did not answer in time", host)))?
            .map_err(|e| WalletError::Network(format!("relay {} refused the connection: {}", host, e)))?;

        log::info!("Relayed pairing link open via {}", host);
        Ok(spawn_pumps(ws))
    }
}

/// Bridge a websocket to a [`PairingLink`] with one reader and one writer task
fn spawn_pumps<S>(ws: WebSocketStream<S>) -> PairingLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<PairingMessage>();

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<PairingMessage>(text.as_str()) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed pairing frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Pairing socket error: {}", e);
                    break;
                }
            }
        }
        log::debug!("Pairing reader finished");
    });

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode pairing message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                log::warn!("Pairing socket write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    PairingLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}
