// Archipel daemon: discovery, secure channel, and file transfer loops.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use archipel_core::identity::LocalIdentity;
use archipel_core::message::SecureObject;
use archipel_core::peer_table::{PeerTable, LIVENESS_TIMEOUT};
use archipel_core::trust_store::TrustStore;
use archipel_node::secure_channel::{Inbound, SecureChannel, PENDING_MAX_AGE};
use archipel_node::transfer::FileTransfer;
use archipel_node::{config, Discovery};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "archipel-node", version, about = "Archipel LAN node daemon")]
struct Cli {
    /// Config file path (overrides the default search).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Discovery port override (the secure channel binds the next port up).
    #[arg(short, long)]
    port: Option<u16>,
    /// Address to send a one-shot unicast HELLO to at startup.
    #[arg(long)]
    ping: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref());
    if let Some(port) = cli.port {
        cfg.discovery_port = port;
    }

    let identity = LocalIdentity::generate();
    let node_id = identity.node_id();
    info!(id = %node_id, "node identity ready");

    let peer_table = Arc::new(PeerTable::new());
    let trust_store =
        Arc::new(TrustStore::open(&cfg.trust_store_path).context("opening trust store")?);
    std::fs::create_dir_all(&cfg.share_dir).context("creating share directory")?;
    std::fs::create_dir_all(&cfg.download_dir).context("creating download directory")?;

    let (channel, inbound) = SecureChannel::bind(
        node_id,
        cfg.secure_port(),
        peer_table.clone(),
        trust_store.clone(),
    )
    .await
    .context("binding secure channel")?;
    let discovery = Discovery::bind(
        node_id,
        cfg.discovery_port,
        cfg.secure_port(),
        Duration::from_secs(cfg.broadcast_interval_secs.max(1)),
        peer_table.clone(),
    )
    .await
    .context("binding discovery")?;
    let transfer = FileTransfer::new(channel.clone(), cfg.download_dir.clone());

    tokio::spawn(channel.clone().run());
    tokio::spawn(discovery.clone().run());
    tokio::spawn(dispatch_loop(inbound, transfer.clone()));
    {
        let peer_table = peer_table.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MAINTENANCE_INTERVAL).await;
                peer_table.sweep(LIVENESS_TIMEOUT);
                channel.sweep_pending(PENDING_MAX_AGE);
            }
        });
    }

    if let Some(ip) = cli.ping {
        discovery.ping(ip).await.context("sending bootstrap hello")?;
    }

    shutdown_signal().await?;
    info!("shutting down");
    Ok(())
}

/// Route decrypted traffic to its consumer. Chat renders here; transfer
/// messages go to the file-transfer engine.
async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    transfer: Arc<FileTransfer>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Object {
                from,
                object: SecureObject::Chat { text },
            } => {
                info!(peer = %from.short(), %text, "chat");
            }
            Inbound::Object {
                from,
                object: SecureObject::FileOffer { manifest },
            } => {
                transfer.handle_offer(from, manifest);
            }
            Inbound::Object {
                from,
                object: SecureObject::FileGet { offer_id },
            } => {
                if let Err(e) = transfer.handle_get(from, &offer_id).await {
                    warn!(peer = %from.short(), offer = %offer_id, error = %e, "serving download failed");
                }
            }
            Inbound::Chunk { from, chunk } => transfer.handle_chunk(from, chunk),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
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
