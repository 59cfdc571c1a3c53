//! Connection Manager: bounded connect-retry and peer lookup by display name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::peer::Peer;
use crate::transport::PeerTransport;

pub struct ConnectionManager {
    transport: Arc<dyn PeerTransport>,
    started: AtomicBool,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            started: AtomicBool::new(false),
        }
    }

    /// Start the transport session without waiting for any peer.
    pub fn start(&self) {
        self.transport.start();
        self.started.store(true, Ordering::SeqCst);
    }

    /// Block until a peer named `display_name` is connected, restarting the transport
    /// session every `check_interval`. Fails once `max_duration` has elapsed.
    pub fn connect(
        &self,
        display_name: &str,
        check_interval: Duration,
        max_duration: Duration,
    ) -> Result<Peer, ConnectionError> {
        let deadline = Instant::now() + max_duration;
        loop {
            if let Some(peer) = self.current_peer(display_name)? {
                info!(peer = %peer, "connected");
                return Ok(peer);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::Timeout(display_name.to_string()));
            }
            debug!(name = display_name, "waiting for connection");
            self.transport.stop();
            self.start();
            std::thread::sleep(check_interval.min(deadline - now));
        }
    }

    /// The connected peer named `display_name`, if any. Peers churn, so call this
    /// before every send rather than caching the result.
    pub fn current_peer(&self, display_name: &str) -> Result<Option<Peer>, ConnectionError> {
        let mut matches = self
            .transport
            .connected_peers()
            .into_iter()
            .filter(|p| p.display_name == display_name);
        let first = matches.next();
        if matches.next().is_some() {
            return Err(ConnectionError::AmbiguousPeer(display_name.to_string()));
        }
        Ok(first)
    }

    pub fn is_connected(&self, display_name: &str) -> bool {
        matches!(self.current_peer(display_name), Ok(Some(_)))
    }

    /// Release the transport session. Idempotent.
    pub fn disconnect(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.transport.stop();
        }
    }
}
