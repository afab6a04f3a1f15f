//! Error taxonomy for the wallet core
//!
//! `RpcError` classifies a single node round-trip. `WalletError` is what
//! the rest of the application sees: every failure that exhausts its retry
//! budget ends up as one of these, and the variant decides whether the UI
//! blocks until the user acts or just shows a transient status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON-RPC error code the node returns while it is still loading
/// (block index, wallet rescan, ...).
pub const RPC_IN_WARMUP: i64 = -28;

/// Classified failure of one RPC round-trip
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// Credentials rejected. Never retried.
    #[error("authentication failed: the node rejected the RPC credentials")]
    AuthenticationFailed,

    /// Network-level failure (refused, reset, timed out)
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// Node is up but still starting or syncing
    #[error("node is busy: {0}")]
    NodeBusy(String),

    /// Response did not have the expected shape
    #[error("malformed response to {method}: {detail}")]
    Malformed { method: String, detail: String },

    /// Node reported an error for this call
    #[error("RPC error {code}: {message}")]
    Node { code: i64, message: String },
}

impl RpcError {
    pub fn malformed(method: &str, detail: impl Into<String>) -> Self {
        RpcError::Malformed {
            method: method.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Unreachable(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, RpcError::NodeBusy(_))
    }
}

/// Crate-wide error taxonomy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WalletError {
    /// Unreachable or invalid setup. Requires user action, never auto-retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rejected credentials. Never auto-retried.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Transient network failure
    #[error("network error: {0}")]
    Network(String),

    /// Node not ready yet
    #[error("node busy: {0}")]
    NodeBusy(String),

    /// Malformed transaction input, names the offending field
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Node accepted the request but it failed downstream. The message is
    /// the node's own diagnostic text.
    #[error("{0}")]
    Submission(String),

    /// Unexpected response shape
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Pairing message sent while no companion device is connected
    #[error("no companion device is connected")]
    NotConnected,
}

impl WalletError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        WalletError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether the policy allows an automatic retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Network(_) | WalletError::NodeBusy(_))
    }

    /// Whether further action is blocked until the user changes something
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            WalletError::Configuration(_)
                | WalletError::Authentication(_)
                | WalletError::Validation { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Configuration(_) => ErrorKind::Configuration,
            WalletError::Authentication(_) => ErrorKind::Authentication,
            WalletError::Network(_) => ErrorKind::Network,
            WalletError::NodeBusy(_) => ErrorKind::NodeBusy,
            WalletError::Validation { .. } => ErrorKind::Validation,
            WalletError::Submission(_) => ErrorKind::Submission,
            WalletError::Malformed(_) => ErrorKind::Malformed,
            WalletError::NotConnected => ErrorKind::NotConnected,
        }
    }
}

impl From<RpcError> for WalletError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::AuthenticationFailed => WalletError::Authentication(
                "the username / password was not accepted by the node".to_string(),
            ),
            RpcError::Unreachable(msg) => WalletError::Network(msg),
            RpcError::NodeBusy(msg) => WalletError::NodeBusy(msg),
            RpcError::Malformed { method, detail } => {
                WalletError::Malformed(format!("{}: {}", method, detail))
            }
            RpcError::Node { message, .. } => WalletError::Submission(message),
        }
    }
}

/// Flat error category, sent to the UI alongside the message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Network,
    NodeBusy,
    Validation,
    Submission,
    Malformed,
    NotConnected,
}
