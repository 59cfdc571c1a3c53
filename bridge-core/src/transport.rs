//! Peer transport capability consumed by the core.
//!
//! The transport owns discovery, sessions, framing and raw file movement. It delivers
//! every callback on its own execution context, never on the thread that called into it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::peer::Peer;

/// Called for every message received from a connected peer.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>, Peer) + Send + Sync>;

/// Outbound transfer progress in `[0, 1]`.
pub type ProgressHandler = Box<dyn Fn(f64) + Send + Sync>;

/// Outbound transfer completion; `None` on success.
pub type CompletionHandler = Box<dyn FnOnce(Option<TransportError>) + Send>;

/// Inbound transfer finished. `result` holds the location of the received file.
#[derive(Debug)]
pub struct InboundFinish {
    pub name: String,
    pub peer: Peer,
    pub result: Result<PathBuf, TransportError>,
}

/// Callbacks for resources pushed to us by a peer.
pub struct InboundHandlers {
    pub on_start: Box<dyn Fn(&str, &Peer) + Send + Sync>,
    pub on_progress: Box<dyn Fn(&str, &Peer, f64) + Send + Sync>,
    pub on_finish: Box<dyn Fn(InboundFinish) + Send + Sync>,
}

/// Session, messaging and file-transfer primitives of a local peer network.
///
/// Handler slots are single-valued: setting a handler replaces the previous one.
pub trait PeerTransport: Send + Sync {
    /// Start (or restart) advertising and accepting connections.
    fn start(&self);

    /// Tear down the session and drop all connections. Idempotent.
    fn stop(&self);

    /// Peers currently connected.
    fn connected_peers(&self) -> Vec<Peer>;

    /// Best-effort, fire-and-forget message send.
    fn send(&self, bytes: Vec<u8>, to: &Peer);

    fn set_message_handler(&self, handler: Option<MessageHandler>);

    /// Push the file at `local_path` to `to` under `name`. Exactly one of the
    /// completion outcomes is reported, after the last progress callback.
    fn send_resource(
        &self,
        local_path: &Path,
        name: &str,
        to: &Peer,
        on_progress: ProgressHandler,
        on_complete: CompletionHandler,
    );

    fn set_inbound_handlers(&self, handlers: Option<Arc<InboundHandlers>>);
}

/// Failure reported by a transport for a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    PeerUnavailable(String),
    #[error("connection lost during transfer")]
    ConnectionLost,
    #[error("integrity check failed for {0}")]
    IntegrityMismatch(String),
    #[error("transport stopped")]
    Stopped,
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
