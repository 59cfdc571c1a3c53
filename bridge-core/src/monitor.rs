//! Monitor side: answers bridge requests, serves downloads and accepts uploads.
//!
//! Requests are handled on the transport's context as they arrive. Metadata requests
//! are answered immediately; `GetResource` starts an outbound transfer and
//! `SendResource` arms the inbound-transfer handlers for exactly one upload.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::peer::Peer;
use crate::protocol::{Request, Response, Status};
use crate::session::{Direction, TransferSession};
use crate::transport::{InboundFinish, InboundHandlers, PeerTransport, TransportError};
use crate::wire;

/// Reply to any request that cannot be decoded.
pub const REQUEST_DECODING_FAILED: &str = "request decoding failed";

/// Lifecycle events for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    StartedWriting { path: String, peer_id: String },
    WroteProgress { path: String, peer_id: String, progress: f64 },
    FinishedWriting { path: String, peer_id: String },
    FailedWriting { path: String, peer_id: String, reason: String },
    StartedSending { path: String, peer_id: String },
    SentProgress { path: String, peer_id: String, progress: f64 },
    FinishedSending { path: String, peer_id: String },
    FailedSending { path: String, peer_id: String, reason: String },
}

/// Receives `MonitorEvent`s, on the transport's context.
pub trait MonitorObserver: Send + Sync {
    fn on_event(&self, event: &MonitorEvent);
}

impl<F> MonitorObserver for F
where
    F: Fn(&MonitorEvent) + Send + Sync,
{
    fn on_event(&self, event: &MonitorEvent) {
        self(event)
    }
}

/// Upload accepted by `SendResource` and not yet finished.
struct ArmedUpload {
    peer: Peer,
    path: String,
    destination: PathBuf,
    armed_at: Instant,
}

type SessionKey = (String, String);

pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    me: Weak<MonitorInner>,
    transport: Arc<dyn PeerTransport>,
    config: MonitorConfig,
    observer: Arc<dyn MonitorObserver>,
    sessions: Mutex<HashMap<SessionKey, TransferSession>>,
    armed: Mutex<Option<ArmedUpload>>,
}

impl Monitor {
    /// Install request and transfer handlers on `transport` and start it.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        config: MonitorConfig,
        observer: Arc<dyn MonitorObserver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| MonitorInner {
            me: me.clone(),
            transport: transport.clone(),
            config,
            observer,
            sessions: Mutex::new(HashMap::new()),
            armed: Mutex::new(None),
        });

        let weak = inner.me.clone();
        transport.set_message_handler(Some(Arc::new(move |bytes: Vec<u8>, from: Peer| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_incoming(&bytes, &from);
            }
        })));
        transport.set_inbound_handlers(Some(Arc::new(upload_handlers(inner.me.clone()))));
        transport.start();
        info!(root = ?inner.config.root, "monitor started");
        Self { inner }
    }

    /// Decode and answer one request from `from`.
    pub fn handle_incoming(&self, bytes: &[u8], from: &Peer) {
        self.inner.handle_incoming(bytes, from);
    }

    /// Snapshot of transfers still in flight.
    pub fn sessions(&self) -> Vec<TransferSession> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    /// Local path a request path maps to, or `None` if it is refused.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        self.inner.resolve(path)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.inner.transport.set_message_handler(None);
        self.inner.transport.set_inbound_handlers(None);
        self.inner.transport.stop();
    }
}

impl MonitorInner {
    fn handle_incoming(&self, bytes: &[u8], from: &Peer) {
        let request = match wire::decode::<Request>(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(from = %from, error = %e, "undecodable request");
                self.reply(Response::ProtocolError(REQUEST_DECODING_FAILED.to_string()), from);
                return;
            }
        };
        debug!(request = %request, from = %from, "request received");
        match &request {
            Request::CheckAvailability(path) => {
                let status = self.availability(path);
                self.reply(Response::Ack(request.clone(), status), from);
            }
            Request::GetResource(path) => self.serve(path, from),
            Request::SendResource(path) => {
                let status = self.accept_upload(path, from);
                self.reply(Response::Ack(request.clone(), status), from);
            }
        }
    }

    fn availability(&self, path: &str) -> Status {
        let Some(local) = self.resolve(path) else {
            return invalid_path(path);
        };
        let readable = local.is_file() && std::fs::File::open(&local).is_ok();
        if readable {
            Status::Success
        } else {
            Status::Error(format!("missing resource: {path}"))
        }
    }

    fn serve(&self, path: &str, peer: &Peer) {
        self.emit(MonitorEvent::StartedSending {
            path: path.to_string(),
            peer_id: peer.id.clone(),
        });
        let Some(local) = self.resolve(path) else {
            self.emit(MonitorEvent::FailedSending {
                path: path.to_string(),
                peer_id: peer.id.clone(),
                reason: format!("invalid resource path: {path}"),
            });
            return;
        };
        let session = TransferSession::new(peer.clone(), path, Direction::Download);
        self.sessions.lock().insert(session.key(), session);

        let key: SessionKey = (peer.id.clone(), path.to_string());
        let progress_inner = self.me.clone();
        let progress_key = key.clone();
        let done_inner = self.me.clone();
        self.transport.send_resource(
            &local,
            path,
            peer,
            Box::new(move |progress: f64| {
                if let Some(inner) = progress_inner.upgrade() {
                    inner.sending_progress(&progress_key, progress);
                }
            }),
            Box::new(move |err: Option<TransportError>| {
                if let Some(inner) = done_inner.upgrade() {
                    inner.sending_finished(&key, err);
                }
            }),
        );
    }

    fn sending_progress(&self, key: &SessionKey, progress: f64) {
        let progress = match self.sessions.lock().get_mut(key) {
            Some(session) => session.advance(progress),
            None => return,
        };
        self.emit(MonitorEvent::SentProgress {
            path: key.1.clone(),
            peer_id: key.0.clone(),
            progress,
        });
    }

    fn sending_finished(&self, key: &SessionKey, err: Option<TransportError>) {
        let session = self.sessions.lock().remove(key);
        let (peer_id, path) = key.clone();
        match err {
            None => {
                if let Some(mut session) = session {
                    session.complete();
                }
                info!(path = %path, peer = %peer_id, "resource sent");
                self.emit(MonitorEvent::FinishedSending { path, peer_id });
            }
            Some(e) => {
                warn!(path = %path, peer = %peer_id, error = %e, "sending failed");
                self.emit(MonitorEvent::FailedSending {
                    path,
                    peer_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Arm for one upload from `peer`. Armed before the `Ack` goes out so the transfer
    /// cannot outrun its handlers.
    ///
    /// An armed upload is given up when its peer asks again, has left, or has not
    /// finished within `upload_timeout`.
    fn accept_upload(&self, path: &str, peer: &Peer) -> Status {
        let Some(destination) = self.resolve(path) else {
            return invalid_path(path);
        };
        let abandoned = {
            let mut armed = self.armed.lock();
            let abandoned = match armed.take() {
                Some(current) if !self.releasable(&current, peer) => {
                    *armed = Some(current);
                    return Status::Error("transfer already in progress".to_string());
                }
                previous => previous,
            };
            *armed = Some(ArmedUpload {
                peer: peer.clone(),
                path: path.to_string(),
                destination,
                armed_at: Instant::now(),
            });
            abandoned
        };
        if let Some(previous) = abandoned {
            self.abandon(previous);
        }
        let session = TransferSession::new(peer.clone(), path, Direction::Upload);
        self.sessions.lock().insert(session.key(), session);
        self.emit(MonitorEvent::StartedWriting {
            path: path.to_string(),
            peer_id: peer.id.clone(),
        });
        Status::Success
    }

    fn releasable(&self, current: &ArmedUpload, requester: &Peer) -> bool {
        current.peer == *requester
            || current.armed_at.elapsed() >= self.config.upload_timeout
            || !self.transport.connected_peers().contains(&current.peer)
    }

    fn abandon(&self, upload: ArmedUpload) {
        let key = (upload.peer.id.clone(), upload.path.clone());
        if let Some(mut session) = self.sessions.lock().remove(&key) {
            session.fail("upload abandoned");
        }
        warn!(path = %upload.path, peer = %upload.peer, "upload abandoned");
        self.emit(MonitorEvent::FailedWriting {
            path: upload.path,
            peer_id: upload.peer.id,
            reason: "upload abandoned".to_string(),
        });
    }

    fn is_armed_for(&self, name: &str, peer: &Peer) -> bool {
        matches!(&*self.armed.lock(), Some(a) if a.peer == *peer && a.path == name)
    }

    fn receiving_started(&self, name: &str, peer: &Peer) {
        if !self.is_armed_for(name, peer) {
            debug!(name, peer = %peer, "ignoring unsolicited transfer");
            return;
        }
        if let Some(session) = self.sessions.lock().get_mut(&(peer.id.clone(), name.to_string())) {
            session.start();
        }
    }

    fn receiving_progress(&self, name: &str, peer: &Peer, progress: f64) {
        if !self.is_armed_for(name, peer) {
            return;
        }
        let key = (peer.id.clone(), name.to_string());
        let progress = match self.sessions.lock().get_mut(&key) {
            Some(session) => session.advance(progress),
            None => return,
        };
        self.emit(MonitorEvent::WroteProgress {
            path: name.to_string(),
            peer_id: peer.id.clone(),
            progress,
        });
    }

    fn receiving_finished(&self, finish: InboundFinish) {
        let upload = {
            let mut armed = self.armed.lock();
            match &*armed {
                Some(a) if a.peer == finish.peer && a.path == finish.name => armed.take(),
                _ => None,
            }
        };
        let Some(upload) = upload else {
            debug!(name = %finish.name, peer = %finish.peer, "ignoring unsolicited transfer");
            if let Ok(local) = finish.result {
                let _ = std::fs::remove_file(local);
            }
            return;
        };
        let key = (upload.peer.id.clone(), upload.path.clone());
        let mut session = self
            .sessions
            .lock()
            .remove(&key)
            .unwrap_or_else(|| TransferSession::new(upload.peer.clone(), &upload.path, Direction::Upload));

        let outcome = match finish.result {
            Ok(local) => {
                let written = finalize(&local, &upload.destination);
                let _ = std::fs::remove_file(&local);
                written.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => {
                session.complete();
                info!(path = %upload.path, peer = %upload.peer, "resource written");
                self.emit(MonitorEvent::FinishedWriting {
                    path: upload.path,
                    peer_id: upload.peer.id,
                });
            }
            Err(reason) => {
                session.fail(reason.as_str());
                warn!(path = %upload.path, peer = %upload.peer, reason = %reason, "upload failed");
                self.emit(MonitorEvent::FailedWriting {
                    path: upload.path,
                    peer_id: upload.peer.id,
                    reason,
                });
            }
        }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        match &self.config.root {
            None => Some(PathBuf::from(path)),
            Some(root) => {
                let relative = Path::new(path.trim_start_matches('/'));
                let safe = relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
                if !safe || relative.as_os_str().is_empty() {
                    return None;
                }
                Some(root.join(relative))
            }
        }
    }

    fn reply(&self, response: Response, to: &Peer) {
        match wire::encode(&response) {
            Ok(bytes) => self.transport.send(bytes, to),
            Err(e) => warn!(error = %e, "failed to encode response"),
        }
    }

    fn emit(&self, event: MonitorEvent) {
        self.observer.on_event(&event);
    }
}

fn invalid_path(path: &str) -> Status {
    Status::Error(format!("invalid resource path: {path}"))
}

/// Move the received bytes to `destination`, creating parent directories and atomically
/// replacing any existing file.
fn finalize(received: &Path, destination: &Path) -> std::io::Result<()> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = parent.join(format!(".{file_name}.{}.part", uuid::Uuid::new_v4()));
    let result = std::fs::copy(received, &partial).and_then(|_| std::fs::rename(&partial, destination));
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn upload_handlers(inner: Weak<MonitorInner>) -> InboundHandlers {
    let start = inner.clone();
    let progress = inner.clone();
    let finish = inner;
    InboundHandlers {
        on_start: Box::new(move |name: &str, peer: &Peer| {
            if let Some(inner) = start.upgrade() {
                inner.receiving_started(name, peer);
            }
        }),
        on_progress: Box::new(move |name: &str, peer: &Peer, p: f64| {
            if let Some(inner) = progress.upgrade() {
                inner.receiving_progress(name, peer, p);
            }
        }),
        on_finish: Box::new(move |done: InboundFinish| {
            if let Some(inner) = finish.upgrade() {
                inner.receiving_finished(done);
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackTransport};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        monitor: Monitor,
        client: Arc<LoopbackTransport>,
        monitor_peer: Peer,
        replies: Receiver<Response>,
        events: Receiver<MonitorEvent>,
        root: tempfile::TempDir,
        network: LoopbackNetwork,
    }

    fn harness() -> Harness {
        harness_with(MonitorConfig::default().upload_timeout)
    }

    fn harness_with(upload_timeout: Duration) -> Harness {
        let network = LoopbackNetwork::new();
        let client = network.join("iPhone");
        let monitor_transport = network.join("monitor");
        client.start();
        let (reply_tx, replies) = crossbeam_channel::unbounded();
        client.set_message_handler(Some(Arc::new(move |bytes: Vec<u8>, _: Peer| {
            let _ = reply_tx.send(wire::decode::<Response>(&bytes).unwrap());
        })));
        let monitor_peer = monitor_transport.local_peer();
        let root = tempfile::tempdir().unwrap();
        let (tx, events) = crossbeam_channel::unbounded();
        let monitor = Monitor::new(
            Arc::new(monitor_transport),
            MonitorConfig {
                root: Some(root.path().to_path_buf()),
                upload_timeout,
            },
            Arc::new(move |e: &MonitorEvent| {
                let _ = tx.send(e.clone());
            }),
        );
        Harness {
            monitor,
            client: Arc::new(client),
            monitor_peer,
            replies,
            events,
            root,
            network,
        }
    }

    impl Harness {
        fn request(&self, req: &Request) -> Response {
            self.client.send(wire::encode(req).unwrap(), &self.monitor_peer);
            self.replies.recv_timeout(TIMEOUT).unwrap()
        }

        fn upload(&self, name: &str, contents: &[u8]) {
            let src = self.root.path().join(".outgoing");
            std::fs::write(&src, contents).unwrap();
            let (tx, rx) = crossbeam_channel::bounded(1);
            self.client.send_resource(
                &src,
                name,
                &self.monitor_peer,
                Box::new(|_: f64| {}),
                Box::new(move |e: Option<TransportError>| tx.send(e.is_none()).unwrap()),
            );
            assert!(rx.recv_timeout(TIMEOUT).unwrap());
        }

        fn next_event(&self) -> MonitorEvent {
            self.events.recv_timeout(TIMEOUT).unwrap()
        }

        fn wait_for(&self, pred: impl Fn(&MonitorEvent) -> bool) -> MonitorEvent {
            loop {
                let e = self.next_event();
                if pred(&e) {
                    return e;
                }
            }
        }
    }

    #[test]
    fn undecodable_request_gets_protocol_error() {
        let h = harness();
        h.client.send(b"garbage".to_vec(), &h.monitor_peer);
        assert_eq!(
            h.replies.recv_timeout(TIMEOUT).unwrap(),
            Response::ProtocolError(REQUEST_DECODING_FAILED.to_string())
        );
        h.client
            .send(br#"{"rawValue":9,"associatedValue":"x"}"#.to_vec(), &h.monitor_peer);
        assert!(matches!(
            h.replies.recv_timeout(TIMEOUT).unwrap(),
            Response::ProtocolError(_)
        ));
    }

    #[test]
    fn check_reports_missing_and_present() {
        let h = harness();
        let req = Request::CheckAvailability("missing/path".into());
        match h.request(&req) {
            Response::Ack(acked, Status::Error(message)) => {
                assert_eq!(acked, req);
                assert_eq!(message, "missing resource: missing/path");
            }
            other => panic!("unexpected {other:?}"),
        }
        std::fs::create_dir_all(h.root.path().join("dir")).unwrap();
        std::fs::write(h.root.path().join("dir/file"), b"x").unwrap();
        let req = Request::CheckAvailability("/dir/file".into());
        assert_eq!(h.request(&req), Response::Ack(req, Status::Success));
        // A directory is not a resource.
        let req = Request::CheckAvailability("dir".into());
        assert!(matches!(h.request(&req), Response::Ack(_, Status::Error(_))));
    }

    #[test]
    fn escaping_paths_refused() {
        let h = harness();
        for path in ["../etc/passwd", "a/../../b", ""] {
            let req = Request::SendResource(path.into());
            match h.request(&req) {
                Response::Ack(_, Status::Error(m)) => assert!(m.starts_with("invalid resource path")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(h.monitor.sessions().is_empty());
    }

    #[test]
    fn upload_is_finalized_to_destination() {
        let h = harness();
        let req = Request::SendResource("nested/deep/file.bin".into());
        assert_eq!(h.request(&req), Response::Ack(req.clone(), Status::Success));
        assert_eq!(
            h.next_event(),
            MonitorEvent::StartedWriting {
                path: "nested/deep/file.bin".into(),
                peer_id: h.client.local_peer().id,
            }
        );
        assert_eq!(h.monitor.sessions().len(), 1);
        h.upload("nested/deep/file.bin", b"payload");
        h.wait_for(|e| matches!(e, MonitorEvent::FinishedWriting { .. }));
        assert_eq!(
            std::fs::read(h.root.path().join("nested/deep/file.bin")).unwrap(),
            b"payload"
        );
        assert!(h.monitor.sessions().is_empty());
    }

    #[test]
    fn upload_progress_events_are_monotonic() {
        let h = harness();
        h.client.set_chunk_size(2);
        let req = Request::SendResource("p.bin".into());
        h.request(&req);
        h.upload("p.bin", b"0123456789");
        let mut progress = Vec::new();
        loop {
            match h.next_event() {
                MonitorEvent::WroteProgress { progress: p, .. } => progress.push(p),
                MonitorEvent::FinishedWriting { .. } => break,
                _ => {}
            }
        }
        assert_eq!(progress.len(), 5);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    /// Third endpoint on the harness network, answering into its own reply channel.
    fn other_client(h: &Harness) -> (LoopbackTransport, Receiver<Response>) {
        let other = h.network.join("iPad");
        other.start();
        let (tx, rx) = crossbeam_channel::unbounded();
        other.set_message_handler(Some(Arc::new(move |bytes: Vec<u8>, _: Peer| {
            let _ = tx.send(wire::decode::<Response>(&bytes).unwrap());
        })));
        (other, rx)
    }

    #[test]
    fn upload_from_other_peer_rejected_while_armed() {
        let h = harness();
        let (other, other_replies) = other_client(&h);
        let first = Request::SendResource("one".into());
        assert_eq!(h.request(&first), Response::Ack(first.clone(), Status::Success));
        let second = Request::SendResource("two".into());
        other.send(wire::encode(&second).unwrap(), &h.monitor_peer);
        assert_eq!(
            other_replies.recv_timeout(TIMEOUT).unwrap(),
            Response::Ack(
                second.clone(),
                Status::Error("transfer already in progress".into())
            )
        );
        h.upload("one", b"1");
        h.wait_for(|e| matches!(e, MonitorEvent::FinishedWriting { .. }));
        other.send(wire::encode(&second).unwrap(), &h.monitor_peer);
        assert_eq!(
            other_replies.recv_timeout(TIMEOUT).unwrap(),
            Response::Ack(second, Status::Success)
        );
    }

    #[test]
    fn abandoned_upload_replaced_by_same_peer() {
        let h = harness();
        let first = Request::SendResource("abandoned.bin".into());
        assert_eq!(h.request(&first), Response::Ack(first, Status::Success));
        let second = Request::SendResource("later.bin".into());
        assert_eq!(h.request(&second), Response::Ack(second, Status::Success));
        let failed = h.wait_for(|e| matches!(e, MonitorEvent::FailedWriting { .. }));
        assert_eq!(
            failed,
            MonitorEvent::FailedWriting {
                path: "abandoned.bin".into(),
                peer_id: h.client.local_peer().id,
                reason: "upload abandoned".into(),
            }
        );
        let sessions = h.monitor.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].resource_path, "later.bin");

        // A late transfer for the abandoned path is not written.
        h.upload("abandoned.bin", b"stale");
        h.upload("later.bin", b"fresh");
        h.wait_for(|e| matches!(e, MonitorEvent::FinishedWriting { .. }));
        assert!(!h.root.path().join("abandoned.bin").exists());
        assert_eq!(std::fs::read(h.root.path().join("later.bin")).unwrap(), b"fresh");
    }

    #[test]
    fn upload_released_when_peer_leaves() {
        let h = harness();
        let (other, other_replies) = other_client(&h);
        let req = Request::SendResource("gone.bin".into());
        other.send(wire::encode(&req).unwrap(), &h.monitor_peer);
        assert_eq!(
            other_replies.recv_timeout(TIMEOUT).unwrap(),
            Response::Ack(req, Status::Success)
        );
        other.stop();
        let mine = Request::SendResource("mine.bin".into());
        assert_eq!(h.request(&mine), Response::Ack(mine, Status::Success));
        h.wait_for(|e| matches!(e, MonitorEvent::FailedWriting { path, .. } if path == "gone.bin"));
    }

    #[test]
    fn stale_upload_expires() {
        let h = harness_with(Duration::from_millis(500));
        let (other, other_replies) = other_client(&h);
        let req = Request::SendResource("slow.bin".into());
        other.send(wire::encode(&req).unwrap(), &h.monitor_peer);
        assert_eq!(
            other_replies.recv_timeout(TIMEOUT).unwrap(),
            Response::Ack(req, Status::Success)
        );
        let mine = Request::SendResource("mine.bin".into());
        assert!(matches!(h.request(&mine), Response::Ack(_, Status::Error(_))));
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(h.request(&mine), Response::Ack(mine, Status::Success));
        h.wait_for(|e| matches!(e, MonitorEvent::FailedWriting { path, .. } if path == "slow.bin"));
    }

    #[test]
    fn unsolicited_transfer_ignored() {
        let h = harness();
        h.upload("sneaky.bin", b"x");
        let req = Request::CheckAvailability("sneaky.bin".into());
        assert!(matches!(h.request(&req), Response::Ack(_, Status::Error(_))));
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn transfer_for_other_path_does_not_complete_armed_upload() {
        let h = harness();
        let req = Request::SendResource("expected.bin".into());
        h.request(&req);
        h.next_event();
        h.upload("other.bin", b"x");
        let check = Request::CheckAvailability("other.bin".into());
        assert!(matches!(h.request(&check), Response::Ack(_, Status::Error(_))));
        assert_eq!(h.monitor.sessions().len(), 1);
    }

    #[test]
    fn failed_upload_disarms_and_reports() {
        let h = harness();
        h.client.set_fail_transfers(true);
        let req = Request::SendResource("f.bin".into());
        h.request(&req);
        let src = h.root.path().join(".outgoing");
        std::fs::write(&src, b"x").unwrap();
        h.client.send_resource(
            &src,
            "f.bin",
            &h.monitor_peer,
            Box::new(|_: f64| {}),
            Box::new(|_: Option<TransportError>| {}),
        );
        let failed = h.wait_for(|e| matches!(e, MonitorEvent::FailedWriting { .. }));
        assert!(matches!(failed, MonitorEvent::FailedWriting { path, .. } if path == "f.bin"));
        assert!(!h.root.path().join("f.bin").exists());
        assert!(h.monitor.sessions().is_empty());
        let again = Request::SendResource("g.bin".into());
        assert_eq!(h.request(&again), Response::Ack(again, Status::Success));
    }

    #[test]
    fn get_resource_streams_and_reports() {
        let h = harness();
        std::fs::write(h.root.path().join("served.txt"), b"served").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        h.client.set_inbound_handlers(Some(Arc::new(InboundHandlers {
            on_start: Box::new(|_: &str, _: &Peer| {}),
            on_progress: Box::new(|_: &str, _: &Peer, _: f64| {}),
            on_finish: Box::new(move |f: InboundFinish| tx.send(f).unwrap()),
        })));
        h.client.send(
            wire::encode(&Request::GetResource("served.txt".into())).unwrap(),
            &h.monitor_peer,
        );
        let finish = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(finish.name, "served.txt");
        assert_eq!(std::fs::read(finish.result.unwrap()).unwrap(), b"served");
        assert!(matches!(h.next_event(), MonitorEvent::StartedSending { .. }));
        h.wait_for(|e| matches!(e, MonitorEvent::FinishedSending { .. }));
    }

    #[test]
    fn get_missing_resource_reports_failure() {
        let h = harness();
        h.client.send(
            wire::encode(&Request::GetResource("nothing.txt".into())).unwrap(),
            &h.monitor_peer,
        );
        h.wait_for(|e| matches!(e, MonitorEvent::FailedSending { path, .. } if path == "nothing.txt"));
        assert!(h.monitor.sessions().is_empty());
    }

    #[test]
    fn resolve_without_root_is_verbatim() {
        let monitor = Monitor::new(
            Arc::new(LoopbackTransport::new("monitor")),
            MonitorConfig::default(),
            Arc::new(|_: &MonitorEvent| {}),
        );
        assert_eq!(monitor.resolve("/abs/path"), Some(PathBuf::from("/abs/path")));
        assert_eq!(monitor.resolve("rel/path"), Some(PathBuf::from("rel/path")));
    }

    #[test]
    fn finalize_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("received");
        std::fs::write(&received, b"new").unwrap();
        let dest = dir.path().join("out/dest.txt");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old contents").unwrap();
        finalize(&received, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        let leftovers = std::fs::read_dir(dest.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
