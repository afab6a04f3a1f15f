//! Companion device pairing
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   pairing module                        │
//! ├─────────────────────────────────────────────────────────┤
//! │  connection_string.rs - hushpair: token, wormhole code  │
//! │  transport.rs         - Direct and relayed websockets   │
//! │  session.rs           - Handshake, heartbeat, requests  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod connection_string;
pub mod session;
pub mod transport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use connection_string::ConnectionString;
pub use session::{start, PairingConfig, PairingHandle, PeerRequest};
pub use transport::{DirectTransport, PairingLink, PairingTransport, PairingTransports, RelayTransport};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    Relayed,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Relayed => "relayed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What the UI shows about the paired device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingSnapshot {
    pub device_id: String,
    pub state: PairingState,
    pub transport: Option<TransportKind>,
    /// Kept across disconnects for "last seen" display
    pub last_seen: Option<DateTime<Utc>>,
}

impl PairingSnapshot {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: PairingState::Disconnected,
            transport: None,
            last_seen: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == PairingState::Connected
    }
}

/// Requests either side can make of the other
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PairingRequest {
    /// Show one of the wallet's receiving addresses on the device
    ShareAddress { address: String, label: Option<String> },
    /// Ask the other side to pay a `hush:` payment URI
    PaymentRequest { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PairingResponse {
    Accepted,
    Rejected { reason: String },
}

/// Frames on the wire, JSON text messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PairingMessage {
    #[serde(rename_all = "camelCase")]
    Hello { device_id: String },
    Heartbeat,
    Request { id: u64, body: PairingRequest },
    Response { id: u64, body: PairingResponse },
}
