//! Thread-safe registry of discovered peers with liveness tracking.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::identity::NodeId;

/// Entries not refreshed within this window are dropped by the sweep.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
struct PeerState {
    ip: IpAddr,
    port: u16,
    last_seen: Instant,
}

/// Snapshot of one table entry.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: Instant,
}

/// A prefix that matched more than one known peer.
#[derive(Debug, thiserror::Error)]
#[error("ambiguous peer prefix, be more specific")]
pub struct AmbiguousPrefix;

/// Registry of reachable peers. One exclusive lock guards the map; no
/// operation holds it across I/O.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<NodeId, PeerState>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Logs only on first sighting.
    pub fn update(&self, node_id: NodeId, ip: IpAddr, port: u16) {
        let mut peers = self.peers.lock();
        let is_new = !peers.contains_key(&node_id);
        peers.insert(
            node_id,
            PeerState {
                ip,
                port,
                last_seen: Instant::now(),
            },
        );
        if is_new {
            info!(peer = %node_id.short(), %ip, port, "new neighbor discovered");
        }
    }

    /// Drop entries older than `timeout`, logging each eviction.
    pub fn sweep(&self, timeout: Duration) {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        peers.retain(|node_id, state| {
            let alive = now.duration_since(state.last_seen) <= timeout;
            if !alive {
                info!(peer = %node_id.short(), "peer lost (liveness timeout)");
            }
            alive
        });
    }

    /// Resolve a unique peer by hex prefix. `Ok(None)` when nothing matches;
    /// a prefix covering several peers is an error, never a silent pick.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Option<NodeId>, AmbiguousPrefix> {
        let peers = self.peers.lock();
        let mut matches = peers.keys().filter(|id| id.to_hex().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(first), None) => Ok(Some(*first)),
            (Some(_), Some(_)) => Err(AmbiguousPrefix),
            (None, _) => Ok(None),
        }
    }

    /// Address to dial for a known peer.
    pub fn addr_of(&self, node_id: &NodeId) -> Option<SocketAddr> {
        let peers = self.peers.lock();
        peers
            .get(node_id)
            .map(|state| SocketAddr::new(state.ip, state.port))
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.lock().contains_key(node_id)
    }

    /// Snapshot of the whole table.
    pub fn list(&self) -> Vec<PeerInfo> {
        let peers = self.peers.lock();
        peers
            .iter()
            .map(|(node_id, state)| PeerInfo {
                node_id: *node_id,
                ip: state.ip,
                port: state.port,
                last_seen: state.last_seen,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id_from_hex(prefix: &str) -> NodeId {
        let mut text = prefix.to_string();
        text.push_str(&"0".repeat(64 - prefix.len()));
        text.parse().unwrap()
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn update_then_lookup() {
        let table = PeerTable::new();
        let id = id_from_hex("aa");
        table.update(id, localhost(), 6001);
        assert!(table.contains(&id));
        assert_eq!(
            table.addr_of(&id),
            Some(SocketAddr::new(localhost(), 6001))
        );
        assert_eq!(table.list().len(), 1);
    }

    #[test]
    fn update_refreshes_address() {
        let table = PeerTable::new();
        let id = id_from_hex("aa");
        table.update(id, localhost(), 6001);
        table.update(id, localhost(), 7001);
        assert_eq!(table.addr_of(&id).unwrap().port(), 7001);
        assert_eq!(table.list().len(), 1);
    }

    #[test]
    fn prefix_lookup_unique_none_ambiguous() {
        let table = PeerTable::new();
        table.update(id_from_hex("abc123"), localhost(), 1);
        table.update(id_from_hex("abc999"), localhost(), 2);

        assert!(table.find_by_prefix("abc").is_err());
        assert_eq!(
            table.find_by_prefix("abc1").unwrap(),
            Some(id_from_hex("abc123"))
        );
        assert_eq!(table.find_by_prefix("ffff").unwrap(), None);
    }

    #[test]
    fn sweep_honours_the_liveness_boundary() {
        let table = PeerTable::new();
        let fresh = id_from_hex("11");
        let stale = id_from_hex("22");
        table.update(fresh, localhost(), 1);
        table.update(stale, localhost(), 2);

        table
            .peers
            .lock()
            .get_mut(&fresh)
            .unwrap()
            .last_seen = Instant::now() - Duration::from_secs(89);
        table
            .peers
            .lock()
            .get_mut(&stale)
            .unwrap()
            .last_seen = Instant::now() - Duration::from_secs(91);

        table.sweep(LIVENESS_TIMEOUT);
        assert!(table.contains(&fresh));
        assert!(!table.contains(&stale));
        assert_eq!(table.list().len(), 1);
    }
}
