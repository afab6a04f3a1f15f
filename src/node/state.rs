//! Connection state and sync status
//!
//! Both values are owned by the RPC session's polling task. Everyone else
//! gets read-only snapshots through watch channels or events.

use crate::error::{ErrorKind, WalletError};
use serde::{Deserialize, Serialize};

/// Lifecycle of the connection to the node
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Embedded daemon is being started
    Launching,
    /// Process is up (or configured) but RPC is not answering yet
    WaitingForDaemon,
    /// Node answers but is behind the network
    Syncing,
    Connected,
    /// Re-enterable: the session retries unless the kind needs user action
    Error { kind: ErrorKind, message: String },
}

impl ConnectionState {
    pub fn error(err: &WalletError) -> Self {
        ConnectionState::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }

    /// Whether the node is answering RPC calls in this state
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Syncing | ConnectionState::Connected)
    }

    /// Short label for the status bar
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "No Connection",
            ConnectionState::Launching => "Starting embedded node",
            ConnectionState::WaitingForDaemon => "Waiting for node",
            ConnectionState::Syncing => "Syncing",
            ConnectionState::Connected => "Connected",
            ConnectionState::Error { .. } => "Connection Error",
        }
    }
}

/// Most recent observation of the node's sync state
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current block height
    pub current_block_height: u64,

    /// Estimated network tip (header height when no estimate is available)
    pub estimated_network_height: u64,

    /// Number of connected peers
    pub peer_count: u32,

    /// Node version string as reported by the node
    pub version_string: String,

    pub is_testnet: bool,
}

impl SyncStatus {
    /// Blocks still to download
    pub fn blocks_behind(&self) -> u64 {
        self.estimated_network_height
            .saturating_sub(self.current_block_height)
    }

    /// Within `tolerance` blocks of the network tip
    pub fn is_synced(&self, tolerance: u64) -> bool {
        self.blocks_behind() <= tolerance
    }

    /// Sync progress (0.0 - 1.0), for progress display only
    pub fn sync_progress(&self) -> f32 {
        if self.estimated_network_height == 0 {
            return 0.0;
        }
        (self.current_block_height as f64 / self.estimated_network_height as f64).min(1.0) as f32
    }
}
