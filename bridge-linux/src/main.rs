// ResourcesBridge for Linux: monitor daemon and client commands over TCP + LAN discovery.

mod config;
mod discovery;
mod frame;
mod integrity;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bridge_core::{Monitor, MonitorEvent, Peer, ResourcesBridge};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::transport::TcpTransport;

#[derive(Parser, Debug)]
#[command(name = "resources-bridge", author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve and accept resources until interrupted
    Monitor {
        /// Resolve request paths under this directory (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Ask the monitor whether a resource is available
    Check { path: String },
    /// Download a resource into a local file
    Get { path: String, out: PathBuf },
    /// Upload a local file to a resource path on the monitor
    Put { file: PathBuf, path: String },
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let mut cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;

    match args.command {
        Command::Monitor { root } => {
            if root.is_some() {
                cfg.root = root;
            }
            run_monitor(&rt, &cfg)
        }
        Command::Check { path } => with_bridge(&rt, &cfg, |bridge| {
            bridge.check_availability(&path)?;
            println!("{path}: available");
            Ok(())
        }),
        Command::Get { path, out } => with_bridge(&rt, &cfg, |bridge| {
            let bytes = bridge.read_resource(&path, print_progress)?;
            eprintln!();
            std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
            println!("{path}: {} bytes -> {}", bytes.len(), out.display());
            Ok(())
        }),
        Command::Put { file, path } => with_bridge(&rt, &cfg, |bridge| {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            bridge.write_resource(&bytes, &path, print_progress)?;
            eprintln!();
            println!("{} -> {path}: {} bytes", file.display(), bytes.len());
            Ok(())
        }),
    }
}

/// Bind the transport on `port` and run discovery for it in the background.
fn host(
    rt: &tokio::runtime::Runtime,
    cfg: &config::Config,
    name: String,
    port: u16,
) -> anyhow::Result<Arc<TcpTransport>> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let transport = TcpTransport::bind(rt.handle().clone(), Peer::generate(name), addr, cfg.inbox.clone())
        .with_context(|| format!("binding transport on {addr}"))?;
    let transport = Arc::new(transport);

    let discovery_transport = transport.clone();
    let discovery_port = cfg.discovery_port;
    rt.spawn(async move {
        if let Err(e) = discovery::run_discovery(discovery_transport, discovery_port).await {
            error!(error = %e, "discovery stopped");
        }
    });
    Ok(transport)
}

fn run_monitor(rt: &tokio::runtime::Runtime, cfg: &config::Config) -> anyhow::Result<()> {
    let transport = host(rt, cfg, cfg.monitor_display_name(), cfg.transport_port)?;
    let local = transport.local_peer();
    let inbox = transport.inbox().to_path_buf();
    let monitor = Monitor::new(transport, cfg.monitor_config(), Arc::new(log_event));
    info!(
        name = %local.display_name,
        root = ?cfg.root,
        inbox = %inbox.display(),
        "monitor ready"
    );

    rt.block_on(shutdown_signal())?;
    info!(in_flight = monitor.sessions().len(), "shutting down");
    drop(monitor);
    Ok(())
}

/// Client commands bind an ephemeral port so they can share a host with a monitor.
fn with_bridge(
    rt: &tokio::runtime::Runtime,
    cfg: &config::Config,
    op: impl FnOnce(&ResourcesBridge) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let transport = host(rt, cfg, cfg.client_display_name(), 0)?;
    let bridge = ResourcesBridge::new(transport, cfg.bridge_config());
    bridge.try_to_connect();
    let monitor = bridge
        .wait_for_connection()
        .with_context(|| format!("no monitor named {:?} found", cfg.monitor_name))?;
    debug!(monitor = %monitor, "connected");
    let result = op(&bridge);
    bridge.abort_connection();
    result
}

fn print_progress(progress: f64) {
    eprint!("\r{:>3.0}%", progress * 100.0);
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::StartedWriting { path, peer_id } => info!(path = %path, peer = %peer_id, "receiving"),
        MonitorEvent::WroteProgress { path, progress, .. } => debug!(path = %path, progress = *progress, "receiving"),
        MonitorEvent::FinishedWriting { path, peer_id } => info!(path = %path, peer = %peer_id, "received"),
        MonitorEvent::FailedWriting { path, reason, .. } => warn!(path = %path, reason = %reason, "receive failed"),
        MonitorEvent::StartedSending { path, peer_id } => info!(path = %path, peer = %peer_id, "sending"),
        MonitorEvent::SentProgress { path, progress, .. } => debug!(path = %path, progress = *progress, "sending"),
        MonitorEvent::FinishedSending { path, peer_id } => info!(path = %path, peer = %peer_id, "sent"),
        MonitorEvent::FailedSending { path, reason, .. } => warn!(path = %path, reason = %reason, "send failed"),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("resources_bridge=info,bridge_core=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
