//! Events pushed to the UI collaborator
//!
//! Everything the core wants the presentation layer to know about travels
//! through an [`EventSink`]. The UI never polls the core for state.

use crate::error::{ErrorKind, WalletError};
use crate::node::state::{ConnectionState, SyncStatus};
use crate::pairing::PairingSnapshot;
use crate::tx::TransactionOutcome;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Structured error payload for the UI
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    /// True while the UI should block the affected feature
    pub blocking: bool,
}

impl From<&WalletError> for ErrorEvent {
    fn from(err: &WalletError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            blocking: err.requires_user_action(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WalletEvent {
    ConnectionState(ConnectionState),
    SyncStatus(SyncStatus),
    /// Connected node has had no peers for the whole warning window
    NoPeers,
    #[serde(rename_all = "camelCase")]
    VersionMismatch {
        node_version: String,
        latest_version: String,
    },
    #[serde(rename_all = "camelCase")]
    ConfigWriteFailed { path: String, error: String },
    #[serde(rename_all = "camelCase")]
    TransactionComputing {
        request_id: u64,
        operation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TransactionOutcome {
        request_id: u64,
        outcome: TransactionOutcome,
    },
    PairingState(PairingSnapshot),
    Error(ErrorEvent),
    Log { level: String, message: String },
}

/// Receiver side of the core's event stream
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WalletEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WalletEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WalletEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn shared() -> (SharedEventSink, mpsc::UnboundedReceiver<WalletEvent>) {
        let (sink, rx) = Self::new();
        (Arc::new(sink), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: WalletEvent) {
        // Receiver gone means the UI shut down first
        let _ = self.tx.send(event);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: WalletEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(WalletEvent::ConnectionState(ConnectionState::WaitingForDaemon));
        sink.emit(WalletEvent::NoPeers);

        assert_eq!(
            rx.try_recv().unwrap(),
            WalletEvent::ConnectionState(ConnectionState::WaitingForDaemon)
        );
        assert_eq!(rx.try_recv().unwrap(), WalletEvent::NoPeers);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = WalletEvent::TransactionComputing {
            request_id: 7,
            operation_id: "opid-1234".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transactionComputing");
        assert_eq!(json["data"]["operationId"], "opid-1234");
    }

    #[test]
    fn test_error_event_from_wallet_error() {
        let err = WalletError::Configuration("daemon=1 set".into());
        let event = ErrorEvent::from(&err);
        assert_eq!(event.kind, ErrorKind::Configuration);
        assert!(event.blocking);
    }
}
