//! TCP `PeerTransport`: one link per peer, bincode frames, chunked resource transfer
//! with per-chunk acknowledgement and SHA-256 verification.
//!
//! Socket work runs on a tokio runtime supplied by the host. Every user callback is
//! delivered, in arrival order, on a single dispatcher thread so that blocking
//! handlers never stall the runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_core::peer::Peer;
use bridge_core::transport::{
    CompletionHandler, InboundFinish, InboundHandlers, MessageHandler, PeerTransport,
    ProgressHandler, TransportError,
};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{read_frame, write_frame, Frame, TransferId, CHUNK_SIZE};
use crate::integrity::ResourceHasher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Handlers {
    message: RwLock<Option<MessageHandler>>,
    inbound: RwLock<Option<Arc<InboundHandlers>>>,
}

/// What an outbound transfer hears back from the receiving side.
enum Reply {
    Ack(u64),
    Done(Option<String>),
}

/// An established, handshaken connection to one peer.
struct Link {
    peer: Peer,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<TransferId, mpsc::UnboundedSender<Reply>>>,
    closed: watch::Sender<bool>,
}

impl Link {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn reply(&self, transfer_id: &TransferId, reply: Reply) {
        match self.pending.lock().get(transfer_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(peer = %self.peer, "reply for unknown transfer"),
        }
    }
}

/// A resource being received on a link.
struct Incoming {
    name: String,
    path: PathBuf,
    file: tokio::fs::File,
    hasher: ResourceHasher,
    total: u64,
}

struct Shared {
    local: Peer,
    runtime: Handle,
    listener: Arc<TcpListener>,
    inbox: PathBuf,
    running: AtomicBool,
    links: Mutex<HashMap<String, Arc<Link>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<Handlers>,
    jobs: crossbeam_channel::Sender<Job>,
}

pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Bind the listener on `addr` (port 0 picks one). The transport starts stopped.
    pub fn bind(runtime: Handle, local: Peer, addr: SocketAddr, inbox: PathBuf) -> std::io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let (jobs, rx) = crossbeam_channel::unbounded::<Job>();
        std::thread::Builder::new()
            .name("resources-bridge-events".to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })?;

        info!(peer = %local, addr = %listener.local_addr()?, "transport bound");
        Ok(Self {
            shared: Arc::new(Shared {
                local,
                runtime,
                listener: Arc::new(listener),
                inbox,
                running: AtomicBool::new(false),
                links: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
                handlers: Arc::new(Handlers::default()),
                jobs,
            }),
        })
    }

    pub fn local_peer(&self) -> Peer {
        self.shared.local.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.listener.local_addr()
    }

    /// Where received resources are written before handing them to the inbound handlers.
    pub fn inbox(&self) -> &Path {
        &self.shared.inbox
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_linked(&self, peer_id: &str) -> bool {
        self.shared.links.lock().contains_key(peer_id)
    }

    /// Dial `addr` in the background. The link shows up in `connected_peers` once the
    /// handshake completes; failures are logged.
    pub fn connect_to(&self, addr: SocketAddr) {
        if !self.shared.is_running() {
            debug!(%addr, "not dialing, transport stopped");
            return;
        }
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = attach(shared, stream).await {
                        debug!(%addr, error = %e, "outbound handshake failed");
                    }
                }
                Err(e) => debug!(%addr, error = %e, "dial failed"),
            }
        });
    }

    /// Close the link to `peer_id`, if any.
    pub fn drop_link(&self, peer_id: &str) {
        let link = self.shared.links.lock().remove(peer_id);
        if let Some(link) = link {
            info!(peer = %link.peer, "dropping link");
            link.close();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PeerTransport for TcpTransport {
    fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
        let mut task = self.shared.accept_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        *task = Some(self.shared.runtime.spawn(accept_loop(shared)));
        debug!(peer = %self.shared.local, "transport started");
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.shared.accept_task.lock().take() {
            task.abort();
        }
        let links: Vec<Arc<Link>> = self.shared.links.lock().drain().map(|(_, l)| l).collect();
        for link in &links {
            link.close();
        }
        if !links.is_empty() {
            info!(peer = %self.shared.local, links = links.len(), "transport stopped");
        }
    }

    fn connected_peers(&self) -> Vec<Peer> {
        if !self.shared.is_running() {
            return Vec::new();
        }
        self.shared
            .links
            .lock()
            .values()
            .filter(|l| !l.is_closed())
            .map(|l| l.peer.clone())
            .collect()
    }

    fn send(&self, bytes: Vec<u8>, to: &Peer) {
        let Some(link) = self.shared.link(&to.id) else {
            debug!(to = %to, "dropping message for unreachable peer");
            return;
        };
        if link.send(Frame::Message(bytes)).is_err() {
            debug!(to = %to, "dropping message, link closing");
        }
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        *self.shared.handlers.message.write() = handler;
    }

    fn send_resource(
        &self,
        local_path: &Path,
        name: &str,
        to: &Peer,
        on_progress: ProgressHandler,
        on_complete: CompletionHandler,
    ) {
        let shared = self.shared.clone();
        let local_path = local_path.to_path_buf();
        let name = name.to_string();
        let to = to.clone();
        let on_progress: Arc<ProgressHandler> = Arc::new(on_progress);
        self.shared.runtime.spawn(async move {
            let outcome = push_resource(&shared, &local_path, &name, &to, &on_progress).await;
            match &outcome {
                Ok(()) => debug!(name = %name, to = %to, "resource sent"),
                Err(e) => warn!(name = %name, to = %to, error = %e, "resource send failed"),
            }
            shared.post(Box::new(move || on_complete(outcome.err())));
        });
    }

    fn set_inbound_handlers(&self, handlers: Option<Arc<InboundHandlers>>) {
        *self.shared.handlers.inbound.write() = handlers;
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn link(&self, peer_id: &str) -> Option<Arc<Link>> {
        if !self.is_running() {
            return None;
        }
        self.links
            .lock()
            .get(peer_id)
            .filter(|l| !l.is_closed())
            .cloned()
    }

    fn unlink(&self, link: &Arc<Link>) {
        link.close();
        let mut links = self.links.lock();
        if links.get(&link.peer.id).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(&link.peer.id);
            info!(peer = %link.peer, "peer disconnected");
        }
    }

    fn post(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!(peer = %self.local, "event dispatcher is gone");
        }
    }

    fn post_message(&self, bytes: Vec<u8>, from: Peer) {
        let handlers = self.handlers.clone();
        self.post(Box::new(move || {
            let handler = handlers.message.read().clone();
            match handler {
                Some(handler) => handler(bytes, from),
                None => debug!(from = %from, "no message handler"),
            }
        }));
    }

    fn post_inbound(&self, event: impl FnOnce(&InboundHandlers) + Send + 'static) {
        let handlers = self.handlers.clone();
        self.post(Box::new(move || {
            let inbound = handlers.inbound.read().clone();
            match inbound {
                Some(inbound) => event(&inbound),
                None => debug!("no inbound handlers, dropping transfer event"),
            }
        }));
    }

    fn post_finish(&self, name: String, peer: Peer, result: Result<PathBuf, TransportError>) {
        self.post_finish_then(name, peer, result, || {});
    }

    /// Deliver a finish event, then run `after` on the dispatcher even if nobody listens.
    fn post_finish_then(
        &self,
        name: String,
        peer: Peer,
        result: Result<PathBuf, TransportError>,
        after: impl FnOnce() + Send + 'static,
    ) {
        let handlers = self.handlers.clone();
        self.post(Box::new(move || {
            let inbound = handlers.inbound.read().clone();
            match inbound {
                Some(inbound) => (inbound.on_finish)(InboundFinish { name, peer, result }),
                None => {
                    debug!(name = %name, "no inbound handlers, dropping finish event");
                    if let Ok(path) = result {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            after();
        }));
    }

    fn post_progress(&self, on_progress: &Arc<ProgressHandler>, progress: f64) {
        let on_progress = on_progress.clone();
        self.post(Box::new(move || on_progress(progress)));
    }
}

async fn accept_loop(shared: Arc<Shared>) {
    loop {
        match shared.listener.accept().await {
            Ok((stream, addr)) => {
                if !shared.is_running() {
                    continue;
                }
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = attach(shared, stream).await {
                        debug!(%addr, error = %e, "inbound handshake failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Exchange `Hello`s on a fresh stream and register the link.
async fn attach(shared: Arc<Shared>, stream: TcpStream) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let hello = Frame::Hello {
        id: shared.local.id.clone(),
        name: shared.local.display_name.clone(),
    };
    write_frame(&mut writer, &hello).await?;
    let peer = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Some(Frame::Hello { id, name }))) => Peer::new(id, name),
        _ => return Err(TransportError::Rejected("handshake failed".to_string())),
    };
    if peer == shared.local {
        return Err(TransportError::Rejected("connected to self".to_string()));
    }

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);
    let link = Arc::new(Link {
        peer: peer.clone(),
        outbound,
        pending: Mutex::new(HashMap::new()),
        closed,
    });
    {
        let mut links = shared.links.lock();
        if !shared.is_running() {
            return Err(TransportError::Stopped);
        }
        if links.contains_key(&peer.id) {
            debug!(peer = %peer, "already linked, dropping duplicate");
            return Ok(());
        }
        links.insert(peer.id.clone(), link.clone());
    }
    info!(peer = %peer, "peer connected");

    shared
        .runtime
        .spawn(write_loop(writer, outbound_rx, closed_rx.clone()));
    shared
        .runtime
        .spawn(read_loop(shared.clone(), link, reader, closed_rx));
    Ok(())
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(error = %e, "link write failed");
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    link: Arc<Link>,
    reader: OwnedReadHalf,
    mut closed: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(reader);
    let mut incoming: HashMap<TransferId, Incoming> = HashMap::new();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = wait_closed(&mut closed) => break,
        };
        match frame {
            Ok(Some(frame)) => handle_frame(&shared, &link, frame, &mut incoming).await,
            Ok(None) => {
                debug!(peer = %link.peer, "link closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %link.peer, error = %e, "link read failed");
                break;
            }
        }
    }

    shared.unlink(&link);
    // Dropping the reply senders fails every outbound transfer on this link.
    link.pending.lock().clear();
    for (_, transfer) in incoming.drain() {
        drop(transfer.file);
        let _ = tokio::fs::remove_file(&transfer.path).await;
        warn!(name = %transfer.name, peer = %link.peer, "inbound transfer interrupted");
        shared.post_finish(
            transfer.name,
            link.peer.clone(),
            Err(TransportError::ConnectionLost),
        );
    }
}

async fn handle_frame(
    shared: &Arc<Shared>,
    link: &Arc<Link>,
    frame: Frame,
    incoming: &mut HashMap<TransferId, Incoming>,
) {
    match frame {
        Frame::Message(bytes) => shared.post_message(bytes, link.peer.clone()),
        Frame::ResourceStart {
            transfer_id,
            name,
            total_len,
        } => match open_incoming(&shared.inbox).await {
            Ok((path, file)) => {
                debug!(name = %name, peer = %link.peer, total_len, "inbound transfer started");
                let (n, p) = (name.clone(), link.peer.clone());
                shared.post_inbound(move |h| (h.on_start)(&n, &p));
                incoming.insert(
                    transfer_id,
                    Incoming {
                        name,
                        path,
                        file,
                        hasher: ResourceHasher::new(),
                        total: total_len,
                    },
                );
            }
            Err(e) => {
                warn!(name = %name, error = %e, "cannot stage inbound transfer");
                let _ = link.send(Frame::ResourceDone {
                    transfer_id,
                    error: Some(e.to_string()),
                });
            }
        },
        Frame::ResourceChunk { transfer_id, data } => {
            let Some(transfer) = incoming.get_mut(&transfer_id) else {
                let _ = link.send(Frame::ResourceDone {
                    transfer_id,
                    error: Some("unknown transfer".to_string()),
                });
                return;
            };
            if let Err(e) = transfer.file.write_all(&data).await {
                if let Some(transfer) = incoming.remove(&transfer_id) {
                    fail_incoming(shared, link, transfer_id, transfer, TransportError::Io(e)).await;
                }
                return;
            }
            transfer.hasher.update(&data);
            let received = transfer.hasher.bytes_hashed();
            let _ = link.send(Frame::ResourceAck {
                transfer_id,
                received,
            });
            let progress = fraction(received, transfer.total);
            let (n, p) = (transfer.name.clone(), link.peer.clone());
            shared.post_inbound(move |h| (h.on_progress)(&n, &p, progress));
        }
        Frame::ResourceEnd {
            transfer_id,
            digest,
        } => {
            let Some(mut transfer) = incoming.remove(&transfer_id) else {
                debug!(peer = %link.peer, "end of unknown transfer");
                return;
            };
            if let Err(e) = transfer.file.flush().await {
                fail_incoming(shared, link, transfer_id, transfer, TransportError::Io(e)).await;
                return;
            }
            let Incoming {
                name,
                path,
                file,
                hasher,
                ..
            } = transfer;
            drop(file);
            if hasher.verify(&digest) {
                debug!(name = %name, peer = %link.peer, "inbound transfer verified");
                // Acknowledge only once the handlers have taken the file.
                let done = link.clone();
                shared.post_finish_then(name, link.peer.clone(), Ok(path), move || {
                    let _ = done.send(Frame::ResourceDone {
                        transfer_id,
                        error: None,
                    });
                });
            } else {
                let _ = tokio::fs::remove_file(&path).await;
                let error = TransportError::IntegrityMismatch(name.clone());
                warn!(name = %name, peer = %link.peer, "digest mismatch");
                let _ = link.send(Frame::ResourceDone {
                    transfer_id,
                    error: Some(error.to_string()),
                });
                shared.post_finish(name, link.peer.clone(), Err(error));
            }
        }
        Frame::ResourceAck {
            transfer_id,
            received,
        } => link.reply(&transfer_id, Reply::Ack(received)),
        Frame::ResourceDone { transfer_id, error } => link.reply(&transfer_id, Reply::Done(error)),
        Frame::Hello { .. } | Frame::Beacon { .. } => {
            debug!(peer = %link.peer, "ignoring unexpected frame");
        }
    }
}

async fn open_incoming(inbox: &Path) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    tokio::fs::create_dir_all(inbox).await?;
    let path = inbox.join(uuid::Uuid::new_v4().to_string());
    let file = tokio::fs::File::create(&path).await?;
    Ok((path, file))
}

async fn fail_incoming(
    shared: &Arc<Shared>,
    link: &Arc<Link>,
    transfer_id: TransferId,
    transfer: Incoming,
    error: TransportError,
) {
    drop(transfer.file);
    let _ = tokio::fs::remove_file(&transfer.path).await;
    warn!(name = %transfer.name, peer = %link.peer, error = %error, "inbound transfer failed");
    let _ = link.send(Frame::ResourceDone {
        transfer_id,
        error: Some(error.to_string()),
    });
    shared.post_finish(transfer.name, link.peer.clone(), Err(error));
}

async fn push_resource(
    shared: &Arc<Shared>,
    local_path: &Path,
    name: &str,
    to: &Peer,
    on_progress: &Arc<ProgressHandler>,
) -> Result<(), TransportError> {
    if !shared.is_running() {
        return Err(TransportError::Stopped);
    }
    let link = shared
        .link(&to.id)
        .ok_or_else(|| TransportError::PeerUnavailable(to.id.clone()))?;
    let mut file = tokio::fs::File::open(local_path).await?;
    let total = file.metadata().await?.len();

    let transfer_id = *uuid::Uuid::new_v4().as_bytes();
    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    link.pending.lock().insert(transfer_id, replies_tx);
    let result = if link.is_closed() {
        Err(TransportError::ConnectionLost)
    } else {
        stream_resource(shared, &link, &mut file, transfer_id, name, total, &mut replies, on_progress).await
    };
    link.pending.lock().remove(&transfer_id);
    result
}

#[allow(clippy::too_many_arguments)]
async fn stream_resource(
    shared: &Arc<Shared>,
    link: &Link,
    file: &mut tokio::fs::File,
    transfer_id: TransferId,
    name: &str,
    total: u64,
    replies: &mut mpsc::UnboundedReceiver<Reply>,
    on_progress: &Arc<ProgressHandler>,
) -> Result<(), TransportError> {
    link.send(Frame::ResourceStart {
        transfer_id,
        name: name.to_string(),
        total_len: total,
    })?;
    let mut hasher = ResourceHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        link.send(Frame::ResourceChunk {
            transfer_id,
            data: buf[..n].to_vec(),
        })?;
        match replies.recv().await {
            Some(Reply::Ack(received)) => shared.post_progress(on_progress, fraction(received, total)),
            Some(Reply::Done(error)) => {
                return Err(TransportError::Rejected(
                    error.unwrap_or_else(|| "transfer ended early".to_string()),
                ))
            }
            None => return Err(TransportError::ConnectionLost),
        }
    }

    link.send(Frame::ResourceEnd {
        transfer_id,
        digest: hasher.finalize(),
    })?;
    loop {
        match replies.recv().await {
            Some(Reply::Ack(_)) => continue,
            Some(Reply::Done(None)) => {
                if total == 0 {
                    shared.post_progress(on_progress, 1.0);
                }
                return Ok(());
            }
            Some(Reply::Done(Some(reason))) => return Err(TransportError::Rejected(reason)),
            None => return Err(TransportError::ConnectionLost),
        }
    }
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}
