//! LAN discovery: periodic HELLO beacons over multicast and broadcast, a
//! listen loop feeding the peer table, and unicast bootstrap pings for
//! networks that filter both.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use archipel_core::identity::NodeId;
use archipel_core::packet::{self, PacketType};
use archipel_core::peer_table::PeerTable;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Well-known discovery multicast group.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
/// A HELLO from a peer is answered with a unicast HELLO at most once per
/// this window, so asymmetric broadcast paths still converge.
const REPLY_WINDOW: Duration = Duration::from_secs(10);

pub struct Discovery {
    node_id: NodeId,
    discovery_port: u16,
    secure_port: u16,
    beacon_interval: Duration,
    /// Bound to the discovery port, joined to the multicast group. Owned by
    /// the listen loop; courtesy replies leave through it.
    listen_socket: Arc<UdpSocket>,
    /// Unbound sender owned by the beacon loop; also used for one-shot pings.
    send_socket: Arc<UdpSocket>,
    peer_table: Arc<PeerTable>,
    /// When each peer last got a courtesy reply.
    last_reply: Mutex<HashMap<NodeId, Instant>>,
    /// Non-loopback addresses already warned about for advertising our id.
    warned_clones: Mutex<HashSet<IpAddr>>,
}

impl Discovery {
    /// Bind both discovery sockets: the listener joins the multicast group,
    /// the sender gets TTL 2 and broadcast enabled.
    pub async fn bind(
        node_id: NodeId,
        discovery_port: u16,
        secure_port: u16,
        beacon_interval: Duration,
        peer_table: Arc<PeerTable>,
    ) -> io::Result<Arc<Self>> {
        let listener = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
        if let Err(e) = listener.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
            warn!(error = %e, "multicast join failed, relying on broadcast only");
        }
        listener.set_nonblocking(true)?;
        let listen_socket = Arc::new(UdpSocket::from_std(listener)?);

        let sender = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        // TTL 2 clears small routers and hotspots.
        sender.set_multicast_ttl_v4(2)?;
        sender.set_broadcast(true)?;
        sender.set_nonblocking(true)?;
        let send_socket = Arc::new(UdpSocket::from_std(sender)?);

        Ok(Arc::new(Self {
            node_id,
            discovery_port,
            secure_port,
            beacon_interval,
            listen_socket,
            send_socket,
            peer_table,
            last_reply: Mutex::new(HashMap::new()),
            warned_clones: Mutex::new(HashSet::new()),
        }))
    }

    /// Run both discovery loops until the task is torn down.
    pub async fn run(self: Arc<Self>) {
        let beacon = tokio::spawn(self.clone().beacon_loop());
        let listen = tokio::spawn(self.listen_loop());
        let _ = tokio::try_join!(beacon, listen);
    }

    async fn beacon_loop(self: Arc<Self>) {
        let payload = packet::encode_hello(&self.node_id, self.secure_port);
        let frame = match packet::encode(PacketType::Hello, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "cannot build hello frame");
                return;
            }
        };
        let multicast = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port));
        loop {
            if let Err(e) = self.send_socket.send_to(&frame, multicast).await {
                debug!(error = %e, "multicast hello failed");
            }
            // Second send in plain broadcast, for networks that drop
            // multicast.
            if let Err(e) = self.send_socket.send_to(&frame, broadcast).await {
                debug!(error = %e, "broadcast hello failed");
            }
            tokio::time::sleep(self.beacon_interval).await;
        }
    }

    async fn listen_loop(self: Arc<Self>) {
        info!(port = self.discovery_port, "discovery listening");
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = match self.listen_socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "discovery receive error");
                    continue;
                }
            };
            let Some((PacketType::Hello, payload)) = packet::decode(&buf[..n]) else {
                continue;
            };
            let Some((peer_id, advertised_port)) = packet::parse_hello(payload) else {
                continue;
            };
            self.on_hello(peer_id, advertised_port, from).await;
        }
    }

    async fn on_hello(&self, peer_id: NodeId, advertised_port: Option<u16>, from: SocketAddr) {
        if peer_id == self.node_id {
            // Our own id from another machine means a cloned identity file
            // somewhere on the network. Warn once per offending address.
            if !from.ip().is_loopback() {
                let mut warned = self.warned_clones.lock();
                if warned.insert(from.ip()) {
                    warn!(addr = %from.ip(), "another node is advertising our identity (cloned key?)");
                }
            }
            return;
        }

        let secure_port = advertised_port.unwrap_or(self.secure_port);
        self.peer_table.update(peer_id, from.ip(), secure_port);

        let reply_due = {
            let mut last = self.last_reply.lock();
            let now = Instant::now();
            match last.get(&peer_id) {
                Some(at) if now.duration_since(*at) < REPLY_WINDOW => false,
                _ => {
                    last.insert(peer_id, now);
                    true
                }
            }
        };
        if reply_due {
            // Unicast ack so the peer learns us even when only one side's
            // broadcast gets through.
            let dest = SocketAddr::new(from.ip(), self.discovery_port);
            if let Err(e) = self.send_hello_to(&self.listen_socket, dest).await {
                debug!(error = %e, "courtesy hello failed");
            }
        }
    }

    /// Directed bootstrap for networks where multicast and broadcast are
    /// filtered.
    pub async fn ping(&self, ip: IpAddr) -> io::Result<()> {
        info!(%ip, "unicast hello");
        self.send_hello_to(&self.send_socket, SocketAddr::new(ip, self.discovery_port))
            .await
    }

    async fn send_hello_to(&self, socket: &UdpSocket, dest: SocketAddr) -> io::Result<()> {
        let payload = packet::encode_hello(&self.node_id, self.secure_port);
        let frame = packet::encode(PacketType::Hello, &payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        socket.send_to(&frame, dest).await?;
        Ok(())
    }
}
