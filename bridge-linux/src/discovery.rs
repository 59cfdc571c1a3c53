//! LAN discovery: UDP multicast beacons, maintain the peer list, dial new peers.
//!
//! Both sides beacon. Only the side with the lower peer id dials, so each pair ends
//! up with a single link.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::frame::{decode_frame, encode_frame, Frame};
use crate::transport::TcpTransport;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerState {
    name: String,
    addr: SocketAddr,
    last_seen: Instant,
}

type Peers = Arc<Mutex<HashMap<String, PeerState>>>;

pub async fn run_discovery(transport: Arc<TcpTransport>, discovery_port: u16) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
    let listen_port = transport.local_addr()?.port();
    info!(port = discovery_port, group = %MULTICAST_GROUP, "discovery running");

    let beacon_task = tokio::spawn(beacon_loop(
        socket.clone(),
        transport.clone(),
        discovery_port,
        listen_port,
    ));
    let recv_task = tokio::spawn(recv_loop(socket, peers.clone(), transport.clone()));
    let timeout_task = tokio::spawn(peer_timeout_loop(peers, transport));

    let (beacon, recv, _) = tokio::try_join!(beacon_task, recv_task, timeout_task)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    beacon?;
    recv
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        discovery_port,
    )))?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    transport: Arc<TcpTransport>,
    discovery_port: u16,
    listen_port: u16,
) -> std::io::Result<()> {
    let local = transport.local_peer();
    let beacon = Frame::Beacon {
        id: local.id,
        name: local.display_name,
        listen_port,
    };
    let frame = encode_frame(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port));
    loop {
        if transport.is_running() {
            if let Err(e) = socket.send_to(&frame, dest).await {
                debug!(error = %e, "beacon send failed");
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Peers,
    transport: Arc<TcpTransport>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let my_id = transport.local_peer().id;
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((Frame::Beacon { id, name, listen_port }, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        if id == my_id {
            continue;
        }
        let addr = SocketAddr::new(from.ip(), listen_port);
        let is_new = {
            let mut p = peers.lock().await;
            let is_new = !p.contains_key(&id);
            p.insert(
                id.clone(),
                PeerState {
                    name: name.clone(),
                    addr,
                    last_seen: Instant::now(),
                },
            );
            is_new
        };
        if is_new {
            info!(peer = %name, id = %id, %addr, "peer discovered");
        }
        if should_dial(&my_id, &id) && transport.is_running() && !transport.is_linked(&id) {
            debug!(peer = %name, %addr, "dialing");
            transport.connect_to(addr);
        }
    }
}

/// The lower id dials.
fn should_dial(my_id: &str, their_id: &str) -> bool {
    my_id < their_id
}

async fn peer_timeout_loop(peers: Peers, transport: Arc<TcpTransport>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let timed_out: Vec<(String, PeerState)> = {
            let mut p = peers.lock().await;
            let stale: Vec<String> = p
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| p.remove(&id).map(|s| (id, s)))
                .collect()
        };
        for (id, state) in timed_out {
            warn!(peer = %state.name, addr = %state.addr, "peer timed out");
            transport.drop_link(&id);
        }
    }
}
