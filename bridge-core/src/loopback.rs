//! In-process transport: every endpoint joined to a `LoopbackNetwork` sees every other
//! running endpoint as connected. Each endpoint delivers its events on a dedicated
//! worker thread, in the order they were posted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::peer::Peer;
use crate::transport::{
    CompletionHandler, InboundFinish, InboundHandlers, MessageHandler, PeerTransport,
    ProgressHandler, TransportError,
};

/// Default size of one simulated transfer chunk (one progress step).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

type Job = Box<dyn FnOnce() + Send>;

/// Shared medium for loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<Vec<Weak<Endpoint>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint advertising `display_name`. It starts stopped.
    pub fn join(&self, display_name: &str) -> LoopbackTransport {
        let peer = Peer::generate(display_name);
        let (jobs, rx) = crossbeam_channel::unbounded::<Job>();
        let worker_name = format!("loopback-{}", display_name);
        let spawned = std::thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                for job in rx {
                    job();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn loopback worker");
        }
        let inbox = std::env::temp_dir().join(format!("resources-bridge-loopback-{}", peer.id));
        let endpoint = Arc::new(Endpoint {
            peer,
            network: self.clone(),
            running: AtomicBool::new(false),
            message_handler: RwLock::new(None),
            inbound: RwLock::new(None),
            jobs,
            inbox,
            chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            fail_transfers: AtomicBool::new(false),
        });
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|e| e.strong_count() > 0);
        endpoints.push(Arc::downgrade(&endpoint));
        LoopbackTransport { endpoint }
    }

    fn running_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|e| e.running.load(Ordering::SeqCst))
            .collect()
    }
}

/// One endpoint of a `LoopbackNetwork`.
pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
}

impl LoopbackTransport {
    /// Two stopped endpoints on a fresh network.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let network = LoopbackNetwork::new();
        (network.join(a), network.join(b))
    }

    /// A stopped endpoint with nobody else on its network.
    pub fn new(display_name: &str) -> Self {
        LoopbackNetwork::new().join(display_name)
    }

    /// How this endpoint appears to the others.
    pub fn local_peer(&self) -> Peer {
        self.endpoint.peer.clone()
    }

    /// Where received resources are written.
    pub fn inbox(&self) -> &Path {
        &self.endpoint.inbox
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.endpoint
            .chunk_size
            .store(chunk_size.max(1), Ordering::SeqCst);
    }

    /// Make every following outbound transfer fail midway.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.endpoint.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Deliver `bytes` to this endpoint's message handler as if `from` had sent them.
    pub fn inject(&self, bytes: Vec<u8>, from: Peer) {
        let me = self.endpoint.clone();
        self.endpoint
            .post(Box::new(move || me.deliver_message(bytes, from)));
    }
}

impl PeerTransport for LoopbackTransport {
    fn start(&self) {
        self.endpoint.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.endpoint.running.store(false, Ordering::SeqCst);
    }

    fn connected_peers(&self) -> Vec<Peer> {
        if !self.endpoint.is_running() {
            return Vec::new();
        }
        self.endpoint
            .network
            .running_endpoints()
            .iter()
            .filter(|e| e.peer != self.endpoint.peer)
            .map(|e| e.peer.clone())
            .collect()
    }

    fn send(&self, bytes: Vec<u8>, to: &Peer) {
        let Some(remote) = self.endpoint.find_remote(to) else {
            debug!(to = %to, "dropping message for unreachable peer");
            return;
        };
        let from = self.endpoint.peer.clone();
        let target = remote.clone();
        remote.post(Box::new(move || target.deliver_message(bytes, from)));
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        *self.endpoint.message_handler.write() = handler;
    }

    fn send_resource(
        &self,
        local_path: &Path,
        name: &str,
        to: &Peer,
        on_progress: ProgressHandler,
        on_complete: CompletionHandler,
    ) {
        let me = self.endpoint.clone();
        let local_path = local_path.to_path_buf();
        let name = name.to_string();
        let to = to.clone();
        self.endpoint.post(Box::new(move || {
            let outcome = me.push_resource(&local_path, &name, &to, &on_progress);
            on_complete(outcome.err());
        }));
    }

    fn set_inbound_handlers(&self, handlers: Option<Arc<InboundHandlers>>) {
        *self.endpoint.inbound.write() = handlers;
    }
}

struct Endpoint {
    peer: Peer,
    network: LoopbackNetwork,
    running: AtomicBool,
    message_handler: RwLock<Option<MessageHandler>>,
    inbound: RwLock<Option<Arc<InboundHandlers>>>,
    jobs: Sender<Job>,
    inbox: PathBuf,
    chunk_size: AtomicUsize,
    fail_transfers: AtomicBool,
}

impl Endpoint {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn post(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!(peer = %self.peer, "loopback worker is gone");
        }
    }

    fn find_remote(&self, to: &Peer) -> Option<Arc<Endpoint>> {
        if !self.is_running() {
            return None;
        }
        self.network
            .running_endpoints()
            .into_iter()
            .find(|e| e.peer == *to && e.peer != self.peer)
    }

    fn deliver_message(&self, bytes: Vec<u8>, from: Peer) {
        if !self.is_running() {
            debug!(peer = %self.peer, "dropping message, endpoint stopped");
            return;
        }
        let handler = self.message_handler.read().clone();
        match handler {
            Some(handler) => handler(bytes, from),
            None => debug!(peer = %self.peer, from = %from, "no message handler"),
        }
    }

    fn inbound_handlers(&self) -> Option<Arc<InboundHandlers>> {
        self.inbound.read().clone()
    }

    fn post_inbound(self: &Arc<Self>, event: impl FnOnce(&InboundHandlers) + Send + 'static) {
        let me = self.clone();
        self.post(Box::new(move || {
            if let Some(handlers) = me.inbound_handlers() {
                event(&handlers);
            } else {
                debug!(peer = %me.peer, "no inbound handlers, dropping transfer event");
            }
        }));
    }

    /// Runs on this endpoint's worker. Remote-side events are posted to the remote's
    /// worker so they interleave correctly with messages sent afterwards.
    fn push_resource(
        &self,
        local_path: &Path,
        name: &str,
        to: &Peer,
        on_progress: &ProgressHandler,
    ) -> Result<(), TransportError> {
        let remote = self
            .find_remote(to)
            .ok_or_else(|| TransportError::PeerUnavailable(to.id.clone()))?;
        let from = self.peer.clone();

        if self.fail_transfers.load(Ordering::SeqCst) {
            let (n, p) = (name.to_string(), from.clone());
            remote.post_inbound(move |h| (h.on_start)(&n, &p));
            let (n, p) = (name.to_string(), from);
            remote.post_inbound(move |h| {
                (h.on_finish)(InboundFinish {
                    name: n,
                    peer: p,
                    result: Err(TransportError::ConnectionLost),
                })
            });
            return Err(TransportError::ConnectionLost);
        }

        let bytes = std::fs::read(local_path)?;
        std::fs::create_dir_all(&remote.inbox)?;
        let dest = remote.inbox.join(uuid::Uuid::new_v4().to_string());
        std::fs::write(&dest, &bytes)?;

        let (n, p) = (name.to_string(), from.clone());
        remote.post_inbound(move |h| (h.on_start)(&n, &p));

        let chunk_size = self.chunk_size.load(Ordering::SeqCst);
        let steps = bytes.len().div_ceil(chunk_size).max(1);
        for step in 1..=steps {
            let progress = step as f64 / steps as f64;
            let (n, p) = (name.to_string(), from.clone());
            remote.post_inbound(move |h| (h.on_progress)(&n, &p, progress));
            on_progress(progress);
        }

        let (n, p) = (name.to_string(), from);
        remote.post_inbound(move |h| {
            (h.on_finish)(InboundFinish {
                name: n,
                peer: p,
                result: Ok(dest),
            })
        });
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.inbox);
    }
}
