//! Secure channel: lazy X25519 handshakes per peer, dual-authenticated
//! encryption of application payloads, and inbound dispatch to the node's
//! message loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use archipel_core::chunk::{self, FileChunk};
use archipel_core::identity::NodeId;
use archipel_core::message::SecureObject;
use archipel_core::packet::{self, PacketType};
use archipel_core::peer_table::PeerTable;
use archipel_core::session::{self, HandshakeEnvelope, PendingHandshake, SessionKeys};
use archipel_core::trust_store::TrustStore;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handshake completion is polled on this cadence by the blocked sender.
const HANDSHAKE_POLL: Duration = Duration::from_millis(20);
/// A send attempt gives the handshake this long before failing.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pending handshakes older than this are dropped by the maintenance sweep:
/// well past the initiator timeout, so only abandoned entries qualify.
pub const PENDING_MAX_AGE: Duration = Duration::from_secs(30);

const SOCKET_BUF_BYTES: usize = 4 * 1024 * 1024;

/// Decrypted traffic handed to the node's dispatch loop.
#[derive(Debug)]
pub enum Inbound {
    /// A structured application object (chat, offers, requests).
    Object { from: NodeId, object: SecureObject },
    /// A binary file-chunk frame.
    Chunk { from: NodeId, chunk: FileChunk },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer not found, discover it first")]
    UnknownPeer,
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error(transparent)]
    Crypto(#[from] session::SessionCryptoError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("chunk frame invalid: {0}")]
    Chunk(#[from] chunk::ChunkCodecError),
    #[error(transparent)]
    Frame(#[from] packet::PacketError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct SecureChannel {
    node_id: NodeId,
    socket: Arc<UdpSocket>,
    peer_table: Arc<PeerTable>,
    trust_store: Arc<TrustStore>,
    sessions: Mutex<HashMap<NodeId, SessionKeys>>,
    pending: Mutex<HashMap<NodeId, PendingHandshake>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl SecureChannel {
    /// Bind the secure socket and hand back the channel plus its inbound
    /// message stream.
    pub async fn bind(
        node_id: NodeId,
        port: u16,
        peer_table: Arc<PeerTable>,
        trust_store: Arc<TrustStore>,
    ) -> io::Result<(Arc<Self>, mpsc::UnboundedReceiver<Inbound>)> {
        let socket = make_socket(port)?;
        let (inbound, receiver) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            node_id,
            socket: Arc::new(socket),
            peer_table,
            trust_store,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            inbound,
        });
        Ok((channel, receiver))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn has_session(&self, peer_id: &NodeId) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    /// Listen loop. Malformed datagrams are dropped without comment; failed
    /// authentication is a logged security event; nothing here is fatal.
    pub async fn run(self: Arc<Self>) {
        info!(port = self.local_port().unwrap_or(0), "secure channel listening");
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "secure receive error");
                    continue;
                }
            };
            let Some((packet_type, payload)) = packet::decode(&buf[..n]) else {
                continue;
            };
            match packet_type {
                PacketType::HandshakeInit => self.on_handshake_init(payload, from).await,
                PacketType::HandshakeResp => self.on_handshake_resp(payload, from),
                PacketType::SecureMsg => self.on_secure_msg(payload, from),
                // Discovery traffic does not belong on this socket.
                PacketType::Hello => {}
            }
        }
    }

    async fn on_handshake_init(&self, payload: &[u8], from: SocketAddr) {
        let Some(envelope) = HandshakeEnvelope::from_payload(payload) else {
            debug!(%from, "undecodable handshake init");
            return;
        };
        let Some(peer_pub) = envelope.public_key() else {
            debug!(%from, "handshake init with bad ephemeral key");
            return;
        };
        let peer_id = envelope.from_id;
        self.note_peer(&peer_id, from);

        let (keys, our_pub) = session::respond_to_init(&self.node_id, &peer_id, &peer_pub);
        // A repeated init overwrites any previous session: rekey by
        // handshake, nothing subtler.
        self.sessions.lock().insert(peer_id, keys);
        info!(peer = %peer_id.short(), "session established (responder)");

        let response = HandshakeEnvelope::new(self.node_id, &our_pub);
        if let Err(e) = self
            .send_handshake_frame(PacketType::HandshakeResp, &response, from)
            .await
        {
            warn!(peer = %peer_id.short(), error = %e, "handshake response failed");
        }
    }

    fn on_handshake_resp(&self, payload: &[u8], from: SocketAddr) {
        let Some(envelope) = HandshakeEnvelope::from_payload(payload) else {
            debug!(%from, "undecodable handshake response");
            return;
        };
        let Some(peer_pub) = envelope.public_key() else {
            debug!(%from, "handshake response with bad ephemeral key");
            return;
        };
        let peer_id = envelope.from_id;
        self.note_peer(&peer_id, from);

        let Some(pending) = self.pending.lock().remove(&peer_id) else {
            debug!(peer = %peer_id.short(), "handshake response without pending init");
            return;
        };
        let keys = pending.complete(&self.node_id, &peer_id, &peer_pub);
        self.sessions.lock().insert(peer_id, keys);
        info!(peer = %peer_id.short(), "session established (initiator)");
    }

    fn on_secure_msg(&self, payload: &[u8], from: SocketAddr) {
        let Some((sender, sealed)) = session::unpack_secure_payload(payload) else {
            return;
        };
        self.note_peer(&sender, from);

        let keys = match self.sessions.lock().get(&sender) {
            Some(keys) => keys.clone(),
            None => {
                debug!(peer = %sender.short(), "secure message without session");
                return;
            }
        };
        let plaintext = match session::open(&keys, &sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(peer = %sender.short(), error = %e, "rejecting unauthenticated message");
                return;
            }
        };
        self.dispatch(sender, plaintext);
    }

    /// Register activity from a sender: peer-table refresh plus TOFU
    /// bookkeeping. Ledger write failures are logged, never fatal here.
    fn note_peer(&self, peer_id: &NodeId, from: SocketAddr) {
        self.peer_table.update(*peer_id, from.ip(), from.port());
        if let Err(e) = self.trust_store.check_or_trust_first_use(peer_id) {
            warn!(peer = %peer_id.short(), error = %e, "trust store write failed");
        }
        if let Err(e) = self.trust_store.mark_seen(peer_id) {
            warn!(peer = %peer_id.short(), error = %e, "trust store write failed");
        }
    }

    /// Route a decrypted payload: chunk frames first, then the tagged object
    /// form, then the bare-text chat fallback.
    fn dispatch(&self, from: NodeId, plaintext: Vec<u8>) {
        if let Some(chunk) = chunk::decode_file_chunk(&plaintext) {
            let _ = self.inbound.send(Inbound::Chunk { from, chunk });
            return;
        }
        match SecureObject::from_slice(&plaintext) {
            Ok(object) => {
                let _ = self.inbound.send(Inbound::Object { from, object });
            }
            Err(_) => match serde_json::from_slice::<serde_json::Value>(&plaintext) {
                Ok(value) => {
                    let kind = value
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("<none>");
                    warn!(peer = %from.short(), kind, "unrecognized secure message kind");
                }
                Err(_) => match String::from_utf8(plaintext) {
                    Ok(text) => {
                        let _ = self.inbound.send(Inbound::Object {
                            from,
                            object: SecureObject::Chat { text },
                        });
                    }
                    Err(_) => warn!(peer = %from.short(), "undecodable secure payload"),
                },
            },
        }
    }

    /// Send a chat line.
    pub async fn send_secure_message(
        &self,
        peer_id: &NodeId,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_secure_object(
            peer_id,
            &SecureObject::Chat {
                text: text.to_string(),
            },
        )
        .await
    }

    /// Send a structured object to a discovered peer, handshaking first if no
    /// session exists yet.
    pub async fn send_secure_object(
        &self,
        peer_id: &NodeId,
        object: &SecureObject,
    ) -> Result<(), ChannelError> {
        self.send_secure_bytes(peer_id, object.to_bytes()?).await
    }

    /// Send an encrypted chunk frame.
    pub async fn send_file_chunk(
        &self,
        peer_id: &NodeId,
        chunk: &FileChunk,
    ) -> Result<(), ChannelError> {
        self.send_secure_bytes(peer_id, chunk::encode_file_chunk(chunk)?)
            .await
    }

    async fn send_secure_bytes(
        &self,
        peer_id: &NodeId,
        plaintext: Vec<u8>,
    ) -> Result<(), ChannelError> {
        let addr = self
            .peer_table
            .addr_of(peer_id)
            .ok_or(ChannelError::UnknownPeer)?;
        // TOFU registration is advisory: it always allows, but the sighting
        // is recorded before we talk.
        self.trust_store.check_or_trust_first_use(peer_id)?;
        self.ensure_session(peer_id, addr).await?;
        let keys = self
            .sessions
            .lock()
            .get(peer_id)
            .cloned()
            .ok_or(ChannelError::HandshakeTimeout)?;
        let sealed = session::seal(&keys, &plaintext)?;
        let payload = session::pack_secure_payload(&self.node_id, &sealed);
        let frame = packet::encode(PacketType::SecureMsg, &payload)?;
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    /// Lazily establish a session: fire HANDSHAKE_INIT and poll for the
    /// responder's keys. The only bounded wait in the channel.
    async fn ensure_session(
        &self,
        peer_id: &NodeId,
        addr: SocketAddr,
    ) -> Result<(), ChannelError> {
        if self.sessions.lock().contains_key(peer_id) {
            return Ok(());
        }

        let pending = PendingHandshake::new();
        let envelope = HandshakeEnvelope::new(self.node_id, pending.public());
        self.pending.lock().insert(*peer_id, pending);
        self.send_handshake_frame(PacketType::HandshakeInit, &envelope, addr)
            .await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while Instant::now() < deadline {
            if self.sessions.lock().contains_key(peer_id) {
                return Ok(());
            }
            tokio::time::sleep(HANDSHAKE_POLL).await;
        }
        Err(ChannelError::HandshakeTimeout)
    }

    async fn send_handshake_frame(
        &self,
        packet_type: PacketType,
        envelope: &HandshakeEnvelope,
        dest: SocketAddr,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(envelope)?;
        let frame = packet::encode(packet_type, &payload)?;
        self.socket.send_to(&frame, dest).await?;
        Ok(())
    }

    /// Drop initiator state for handshakes the peer never answered.
    pub fn sweep_pending(&self, max_age: Duration) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.age() <= max_age);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, "abandoned handshakes swept");
        }
    }
}

fn make_socket(port: u16) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_send_buffer_size(SOCKET_BUF_BYTES)?;
    socket.set_recv_buffer_size(SOCKET_BUF_BYTES)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}
