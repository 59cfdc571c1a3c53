//! ResourcesBridge core: envelope codec, request/response coordination and resource
//! transfer between a bridge (client) and a monitor, over any `PeerTransport`.
//! Blocking API; the host supplies the transport and its threads.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod loopback;
pub mod monitor;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod wire;

pub use bridge::ResourcesBridge;
pub use config::{BridgeConfig, MonitorConfig};
pub use error::{BridgeError, ConnectionError};
pub use monitor::{Monitor, MonitorEvent, MonitorObserver};
pub use peer::Peer;
pub use protocol::{Request, Response, Status};
pub use storage::{StorageError, TemporaryStorage};
pub use transport::{InboundFinish, InboundHandlers, PeerTransport, TransportError};
pub use wire::{decode, encode, DecodeError, EncodeError, MAX_ENVELOPE_LEN};
