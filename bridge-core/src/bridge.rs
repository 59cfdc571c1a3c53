//! Client-side bridge: availability checks, downloads and uploads against the monitor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::coordinator::{require_success, Coordinator};
use crate::error::{BridgeError, ConnectionError};
use crate::peer::Peer;
use crate::protocol::Request;
use crate::session::ProgressTracker;
use crate::storage::TemporaryStorage;
use crate::transport::{InboundFinish, InboundHandlers, PeerTransport, TransportError};

enum DownloadEvent {
    Progress { name: String, peer: Peer, progress: f64 },
    Finished(InboundFinish),
}

enum UploadEvent {
    Progress(f64),
    Finished(Option<TransportError>),
}

type DownloadSlot = Arc<Mutex<Option<Sender<DownloadEvent>>>>;

/// One conversation with the monitor. Operations block the calling thread; at most one
/// runs at a time per instance.
pub struct ResourcesBridge {
    transport: Arc<dyn PeerTransport>,
    config: BridgeConfig,
    connection: ConnectionManager,
    coordinator: Coordinator,
    storage: TemporaryStorage,
    downloads: DownloadSlot,
    busy: AtomicBool,
}

impl ResourcesBridge {
    /// Take over `transport`'s message and inbound-transfer handlers.
    pub fn new(transport: Arc<dyn PeerTransport>, config: BridgeConfig) -> Self {
        let downloads: DownloadSlot = Arc::new(Mutex::new(None));
        transport.set_inbound_handlers(Some(Arc::new(download_router(downloads.clone()))));
        Self {
            connection: ConnectionManager::new(transport.clone()),
            coordinator: Coordinator::new(transport.clone()),
            storage: TemporaryStorage::new(config.staging_dir.clone()),
            transport,
            config,
            downloads,
            busy: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn storage(&self) -> &TemporaryStorage {
        &self.storage
    }

    pub fn try_to_connect(&self) {
        self.connection.start();
    }

    pub fn abort_connection(&self) {
        self.connection.disconnect();
    }

    /// Connect-with-retry using the configured interval and duration.
    pub fn wait_for_connection(&self) -> Result<Peer, ConnectionError> {
        self.connect(self.config.check_interval, self.config.connect_duration)
    }

    pub fn connect(
        &self,
        check_interval: std::time::Duration,
        max_duration: std::time::Duration,
    ) -> Result<Peer, ConnectionError> {
        self.connection
            .connect(&self.config.monitor_name, check_interval, max_duration)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected(&self.config.monitor_name)
    }

    /// Succeeds iff the monitor reports a readable resource at `path`.
    pub fn check_availability(&self, path: &str) -> Result<(), BridgeError> {
        let _op = self.begin()?;
        let monitor = self.monitor_peer()?;
        self.check_with(&monitor, path)
    }

    /// Download the resource at `path`. `on_progress` sees a non-decreasing sequence
    /// in `[0, 1]` ending with `1.0`.
    pub fn read_resource(
        &self,
        path: &str,
        on_progress: impl FnMut(f64),
    ) -> Result<Vec<u8>, BridgeError> {
        let _op = self.begin()?;
        let monitor = self.monitor_peer()?;
        self.check_with(&monitor, path)?;

        let download = DownloadListener::register(&self.downloads)?;
        self.coordinator
            .send(&Request::GetResource(path.to_string()), &monitor)?;

        let mut tracker = ProgressTracker::new(on_progress);
        let deadline = Instant::now() + self.config.transfer_timeout;
        loop {
            match download.rx.recv_deadline(deadline) {
                Ok(DownloadEvent::Progress {
                    name,
                    peer,
                    progress,
                }) => {
                    if peer == monitor && name == path {
                        tracker.report(progress);
                    }
                }
                Ok(DownloadEvent::Finished(finish)) => {
                    if finish.peer != monitor {
                        warn!(from = %finish.peer, "ignoring transfer from unexpected peer");
                        if let Ok(local) = finish.result {
                            drop(ReceivedFile(local));
                        }
                        continue;
                    }
                    let local = finish
                        .result
                        .map_err(|e| BridgeError::TransferFailed(e.to_string()))?;
                    let _received = ReceivedFile(local.clone());
                    if finish.name != path {
                        warn!(received = %finish.name, requested = path, "resource mismatch");
                        return Err(BridgeError::ResourceMismatch);
                    }
                    let bytes = std::fs::read(&local)
                        .map_err(|e| BridgeError::TransferFailed(e.to_string()))?;
                    tracker.finish();
                    info!(path, len = bytes.len(), "resource read");
                    return Ok(bytes);
                }
                Err(RecvTimeoutError::Timeout) => return Err(BridgeError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::Disconnected),
            }
        }
    }

    /// Upload `bytes` to `path` on the monitor. Staged files are removed on return,
    /// whatever the outcome.
    pub fn write_resource(
        &self,
        bytes: &[u8],
        path: &str,
        on_progress: impl FnMut(f64),
    ) -> Result<(), BridgeError> {
        let _op = self.begin()?;
        let staging = self.storage.scope();
        let monitor = self.monitor_peer()?;
        let staged = staging.stage(bytes)?;

        let status = self.coordinator.send_and_await(
            &Request::SendResource(path.to_string()),
            &monitor,
            self.config.response_timeout,
        )?;
        require_success(status)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let progress_tx = tx.clone();
        self.transport.send_resource(
            &staged,
            path,
            &monitor,
            Box::new(move |p: f64| {
                let _ = progress_tx.send(UploadEvent::Progress(p));
            }),
            Box::new(move |err: Option<TransportError>| {
                let _ = tx.send(UploadEvent::Finished(err));
            }),
        );

        let mut tracker = ProgressTracker::new(on_progress);
        let deadline = Instant::now() + self.config.transfer_timeout;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(UploadEvent::Progress(p)) => tracker.report(p),
                Ok(UploadEvent::Finished(None)) => {
                    tracker.finish();
                    info!(path, len = bytes.len(), "resource written");
                    return Ok(());
                }
                Ok(UploadEvent::Finished(Some(e))) => {
                    return Err(BridgeError::TransferFailed(e.to_string()))
                }
                Err(RecvTimeoutError::Timeout) => return Err(BridgeError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::TransferFailed(
                        "transport dropped the transfer".to_string(),
                    ))
                }
            }
        }
    }

    fn check_with(&self, monitor: &Peer, path: &str) -> Result<(), BridgeError> {
        let status = self.coordinator.send_and_await(
            &Request::CheckAvailability(path.to_string()),
            monitor,
            self.config.response_timeout,
        )?;
        require_success(status)
    }

    /// Resolve the monitor afresh; peers may have dropped since the last call.
    fn monitor_peer(&self) -> Result<Peer, BridgeError> {
        self.connection
            .current_peer(&self.config.monitor_name)?
            .ok_or(BridgeError::Disconnected)
    }

    fn begin(&self) -> Result<OperationGuard<'_>, BridgeError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::OperationInProgress);
        }
        Ok(OperationGuard(&self.busy))
    }
}

impl Drop for ResourcesBridge {
    fn drop(&mut self) {
        self.transport.set_inbound_handlers(None);
        self.storage.cleanup();
    }
}

struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Claimed download slot; registered before `GetResource` goes out.
struct DownloadListener<'a> {
    slot: &'a DownloadSlot,
    rx: Receiver<DownloadEvent>,
}

impl<'a> DownloadListener<'a> {
    fn register(slot: &'a DownloadSlot) -> Result<Self, BridgeError> {
        let mut current = slot.lock();
        if current.is_some() {
            return Err(BridgeError::OperationInProgress);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        *current = Some(tx);
        Ok(Self { slot, rx })
    }
}

impl Drop for DownloadListener<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Transport-owned copy of a downloaded resource, removed once read.
struct ReceivedFile(PathBuf);

impl Drop for ReceivedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "could not remove received file");
        }
    }
}

fn download_router(slot: DownloadSlot) -> InboundHandlers {
    let progress_slot = slot.clone();
    let finish_slot = slot;
    InboundHandlers {
        on_start: Box::new(|name: &str, peer: &Peer| debug!(name, peer = %peer, "start receiving")),
        on_progress: Box::new(move |name: &str, peer: &Peer, progress: f64| {
            if let Some(tx) = progress_slot.lock().as_ref() {
                let _ = tx.send(DownloadEvent::Progress {
                    name: name.to_string(),
                    peer: peer.clone(),
                    progress,
                });
            }
        }),
        on_finish: Box::new(move |finish: InboundFinish| {
            let listener = finish_slot.lock().clone();
            match listener {
                Some(tx) => {
                    let _ = tx.send(DownloadEvent::Finished(finish));
                }
                None => {
                    debug!(name = %finish.name, "no pending download, discarding transfer");
                    if let Ok(path) = finish.result {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
        }),
    }
}
