//! Request-response coordination: one blocking, timeout-bounded exchange at a time.
//!
//! The coordinator owns the transport's message handler for its whole lifetime and
//! routes incoming messages into the single listener slot. An exchange must claim the
//! slot (`register`) before its request can be transmitted, so a fast reply always
//! finds a listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::peer::Peer;
use crate::protocol::{Request, Response, Status};
use crate::transport::PeerTransport;
use crate::wire;

struct Inbound {
    bytes: Vec<u8>,
    from: Peer,
}

type Slot = Arc<Mutex<Option<Sender<Inbound>>>>;

pub struct Coordinator {
    transport: Arc<dyn PeerTransport>,
    slot: Slot,
}

impl Coordinator {
    /// Install the message router on `transport`. Replaces any previous message handler.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        let slot: Slot = Arc::new(Mutex::new(None));
        let router = slot.clone();
        transport.set_message_handler(Some(Arc::new(move |bytes: Vec<u8>, from: Peer| {
            let listener = router.lock().clone();
            match listener {
                Some(tx) => {
                    if tx.try_send(Inbound { bytes, from }).is_err() {
                        debug!("exchange already resolved, dropping extra message");
                    }
                }
                None => debug!(from = %from, "no pending exchange, dropping message"),
            }
        })));
        Self { transport, slot }
    }

    /// Claim the listener slot for an exchange with `peer`. Fails fast with
    /// `OperationInProgress` while another exchange holds it.
    pub fn register(&self, peer: &Peer) -> Result<Exchange<'_>, BridgeError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(BridgeError::OperationInProgress);
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        *slot = Some(tx);
        Ok(Exchange {
            coordinator: self,
            peer: peer.clone(),
            rx,
        })
    }

    /// Send `request` to `peer` and block until its correlated reply or `timeout`.
    pub fn send_and_await(
        &self,
        request: &Request,
        peer: &Peer,
        timeout: Duration,
    ) -> Result<Status, BridgeError> {
        let exchange = self.register(peer)?;
        exchange.transmit(request)?;
        exchange.await_status(request, timeout)
    }

    /// Fire-and-forget send, for requests answered by a transfer instead of an `Ack`.
    pub fn send(&self, request: &Request, peer: &Peer) -> Result<(), BridgeError> {
        let bytes = wire::encode(request)?;
        debug!(request = %request, peer = %peer, "sending request");
        self.transport.send(bytes, peer);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.transport.set_message_handler(None);
    }
}

/// A claimed listener slot. Dropping it frees the slot on every exit path.
pub struct Exchange<'a> {
    coordinator: &'a Coordinator,
    peer: Peer,
    rx: Receiver<Inbound>,
}

impl Exchange<'_> {
    pub fn transmit(&self, request: &Request) -> Result<(), BridgeError> {
        self.coordinator.send(request, &self.peer)
    }

    /// Wait for the reply to `request` and validate its origin and correlation.
    pub fn await_status(self, request: &Request, timeout: Duration) -> Result<Status, BridgeError> {
        let deadline = Instant::now() + timeout;
        let inbound = match self.rx.recv_deadline(deadline) {
            Ok(inbound) => inbound,
            Err(RecvTimeoutError::Timeout) => {
                warn!(request = %request, peer = %self.peer, "no response before deadline");
                return Err(BridgeError::Timeout);
            }
            Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::Disconnected),
        };
        let response = wire::decode::<Response>(&inbound.bytes)?;
        if inbound.from != self.peer {
            warn!(from = %inbound.from, expected = %self.peer, "response from unexpected peer");
            return Err(BridgeError::UnexpectedResponse);
        }
        match response {
            Response::Ack(acked, status) if acked == *request => Ok(status),
            Response::Ack(acked, _) => {
                warn!(acked = %acked, pending = %request, "response for a different request");
                Err(BridgeError::UnexpectedResponse)
            }
            Response::ProtocolError(message) => Err(BridgeError::RemoteError(message)),
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        *self.coordinator.slot.lock() = None;
    }
}

/// Map an `Ack` status to the operation result.
pub fn require_success(status: Status) -> Result<(), BridgeError> {
    match status {
        Status::Success => Ok(()),
        Status::Error(message) => Err(BridgeError::RemoteError(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackTransport};

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Coordinator on `client`, with `monitor` answering through `reply`.
    fn setup(
        reply: impl Fn(Request) -> Option<Response> + Send + Sync + 'static,
    ) -> (Coordinator, Arc<LoopbackTransport>, Peer) {
        let (client, monitor) = LoopbackTransport::pair("phone", "monitor");
        client.start();
        monitor.start();
        let monitor = Arc::new(monitor);
        let responder = Arc::downgrade(&monitor);
        monitor.set_message_handler(Some(Arc::new(move |bytes: Vec<u8>, from: Peer| {
            let Some(t) = responder.upgrade() else { return };
            let req: Request = wire::decode(&bytes).unwrap();
            if let Some(resp) = reply(req) {
                t.send(wire::encode(&resp).unwrap(), &from);
            }
        })));
        let monitor_peer = monitor.local_peer();
        (Coordinator::new(Arc::new(client)), monitor, monitor_peer)
    }

    #[test]
    fn matching_ack_resolves() {
        let (coordinator, _monitor, peer) = setup(|req| Some(Response::Ack(req, Status::Success)));
        let req = Request::CheckAvailability("a".into());
        let status = coordinator.send_and_await(&req, &peer, TIMEOUT).unwrap();
        assert_eq!(status, Status::Success);
        assert!(coordinator.is_idle());
    }

    #[test]
    fn error_status_is_returned() {
        let (coordinator, _monitor, peer) =
            setup(|req| Some(Response::Ack(req, Status::Error("missing resource: a".into()))));
        let req = Request::CheckAvailability("a".into());
        let status = coordinator.send_and_await(&req, &peer, TIMEOUT).unwrap();
        assert!(matches!(
            require_success(status),
            Err(BridgeError::RemoteError(m)) if m == "missing resource: a"
        ));
    }

    #[test]
    fn ack_for_other_request_rejected() {
        let (coordinator, _monitor, peer) = setup(|_| {
            Some(Response::Ack(
                Request::CheckAvailability("other".into()),
                Status::Success,
            ))
        });
        let req = Request::CheckAvailability("a".into());
        assert!(matches!(
            coordinator.send_and_await(&req, &peer, TIMEOUT),
            Err(BridgeError::UnexpectedResponse)
        ));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn protocol_error_surfaces_as_remote_error() {
        let (coordinator, _monitor, peer) =
            setup(|_| Some(Response::ProtocolError("request decoding failed".into())));
        let req = Request::GetResource("a".into());
        assert!(matches!(
            coordinator.send_and_await(&req, &peer, TIMEOUT),
            Err(BridgeError::RemoteError(m)) if m == "request decoding failed"
        ));
    }

    #[test]
    fn undecodable_reply_is_protocol_error() {
        let (client, monitor) = LoopbackTransport::pair("phone", "monitor");
        client.start();
        monitor.start();
        let monitor = Arc::new(monitor);
        let responder = Arc::downgrade(&monitor);
        monitor.set_message_handler(Some(Arc::new(move |_: Vec<u8>, from: Peer| {
            if let Some(t) = responder.upgrade() {
                t.send(b"{\"rawValue\":42}".to_vec(), &from);
            }
        })));
        let peer = monitor.local_peer();
        let coordinator = Coordinator::new(Arc::new(client));
        let req = Request::SendResource("a".into());
        assert!(matches!(
            coordinator.send_and_await(&req, &peer, TIMEOUT),
            Err(BridgeError::ProtocolError(_))
        ));
    }

    #[test]
    fn timeout_releases_listener() {
        let (coordinator, _monitor, peer) = setup(|_| None);
        let req = Request::CheckAvailability("a".into());
        let started = Instant::now();
        assert!(matches!(
            coordinator.send_and_await(&req, &peer, Duration::from_millis(100)),
            Err(BridgeError::Timeout)
        ));
        assert!(started.elapsed() < TIMEOUT);
        assert!(coordinator.is_idle());
        assert!(coordinator.register(&peer).is_ok());
    }

    #[test]
    fn second_exchange_fails_fast() {
        let (coordinator, _monitor, peer) = setup(|_| None);
        let _held = coordinator.register(&peer).unwrap();
        let req = Request::CheckAvailability("a".into());
        assert!(matches!(
            coordinator.send_and_await(&req, &peer, TIMEOUT),
            Err(BridgeError::OperationInProgress)
        ));
    }

    #[test]
    fn response_from_other_peer_never_succeeds() {
        let network = LoopbackNetwork::new();
        let client = network.join("phone");
        let monitor = network.join("monitor");
        let intruder = network.join("monitor-lookalike");
        for t in [&client, &monitor, &intruder] {
            t.start();
        }
        let client = Arc::new(client);
        let coordinator = Coordinator::new(client.clone());
        let req = Request::CheckAvailability("a".into());

        let exchange = coordinator.register(&monitor.local_peer()).unwrap();
        // Correctly correlated ack, but from the wrong peer.
        let spoof = wire::encode(&Response::Ack(req.clone(), Status::Success)).unwrap();
        intruder.send(spoof, &client.local_peer());
        exchange.transmit(&req).unwrap();
        assert!(matches!(
            exchange.await_status(&req, TIMEOUT),
            Err(BridgeError::UnexpectedResponse)
        ));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn undecodable_reply_from_other_peer_is_protocol_error() {
        let network = LoopbackNetwork::new();
        let client = network.join("phone");
        let monitor = network.join("monitor");
        let intruder = network.join("monitor-lookalike");
        for t in [&client, &monitor, &intruder] {
            t.start();
        }
        let client = Arc::new(client);
        let coordinator = Coordinator::new(client.clone());
        let req = Request::CheckAvailability("a".into());

        let exchange = coordinator.register(&monitor.local_peer()).unwrap();
        intruder.send(b"garbage".to_vec(), &client.local_peer());
        exchange.transmit(&req).unwrap();
        assert!(matches!(
            exchange.await_status(&req, TIMEOUT),
            Err(BridgeError::ProtocolError(_))
        ));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn stale_reply_without_listener_is_dropped() {
        let (client, monitor) = LoopbackTransport::pair("phone", "monitor");
        client.start();
        monitor.start();
        let client = Arc::new(client);
        let coordinator = Coordinator::new(client.clone());
        let req = Request::CheckAvailability("a".into());
        let stale = wire::encode(&Response::Ack(req.clone(), Status::Success)).unwrap();
        client.inject(stale, monitor.local_peer());
        std::thread::sleep(Duration::from_millis(50));
        // The stale ack must not satisfy a later exchange.
        assert!(matches!(
            coordinator.send_and_await(&req, &monitor.local_peer(), Duration::from_millis(100)),
            Err(BridgeError::Timeout)
        ));
    }
}
