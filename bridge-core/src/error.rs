//! Error taxonomy returned by the public operations.

use crate::storage::StorageError;
use crate::wire::{DecodeError, EncodeError};

/// Connection Manager failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no peer named {0:?} became reachable in time")]
    Timeout(String),
    #[error("more than one connected peer is named {0:?}")]
    AmbiguousPeer(String),
}

/// Failures of the request/response and transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("monitor is not connected")]
    Disconnected,
    #[error("more than one connected peer is named {0:?}")]
    AmbiguousPeer(String),
    #[error("another operation is already in progress")]
    OperationInProgress,
    #[error("protocol error: {0}")]
    ProtocolError(#[from] DecodeError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] EncodeError),
    #[error("response does not belong to the pending request")]
    UnexpectedResponse,
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("received resource does not match the requested path")]
    ResourceMismatch,
    #[error("temporary storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("timed out waiting for the monitor")]
    Timeout,
}

impl From<ConnectionError> for BridgeError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout(_) => BridgeError::Disconnected,
            ConnectionError::AmbiguousPeer(name) => BridgeError::AmbiguousPeer(name),
        }
    }
}
