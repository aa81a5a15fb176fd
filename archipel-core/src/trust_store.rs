//! Trust-on-first-use ledger, persisted as JSON on every mutation. Records
//! are created untrusted the first time an identity is seen and never
//! deleted; the `trusted` flag is advisory metadata for display layers.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::NodeId;

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub trusted: bool,
    pub first_seen: u64,
    pub last_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustData {
    peers: BTreeMap<String, TrustRecord>,
}

/// Outcome of the TOFU check. Both outcomes allow communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstUse {
    Known,
    FirstSeen,
}

pub struct TrustStore {
    path: PathBuf,
    data: Mutex<TrustData>,
}

impl TrustStore {
    /// Open or create the ledger at `path`. A corrupt file is reset to an
    /// empty ledger with a warning rather than blocking startup.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let existed = path.exists();
        let data = if existed {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<TrustData>(&text) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "trust store unreadable, starting empty");
                        TrustData::default()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "trust store unreadable, starting empty");
                    TrustData::default()
                }
            }
        } else {
            TrustData::default()
        };
        let store = Self {
            path,
            data: Mutex::new(data),
        };
        if !existed {
            store.persist(&store.data.lock())?;
        }
        Ok(store)
    }

    fn persist(&self, data: &TrustData) -> io::Result<()> {
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, text)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// TOFU check: record an unknown peer as untrusted and report whether it
    /// was already known. Never blocks communication.
    pub fn check_or_trust_first_use(&self, node_id: &NodeId) -> io::Result<FirstUse> {
        let mut data = self.data.lock();
        if data.peers.contains_key(&node_id.to_hex()) {
            return Ok(FirstUse::Known);
        }
        let now = Self::now();
        data.peers.insert(
            node_id.to_hex(),
            TrustRecord {
                trusted: false,
                first_seen: now,
                last_seen: now,
            },
        );
        self.persist(&data)?;
        Ok(FirstUse::FirstSeen)
    }

    /// Refresh `last_seen` for a known peer. Unknown peers are a no-op.
    pub fn mark_seen(&self, node_id: &NodeId) -> io::Result<()> {
        let mut data = self.data.lock();
        if let Some(record) = data.peers.get_mut(&node_id.to_hex()) {
            record.last_seen = Self::now();
            self.persist(&data)?;
        }
        Ok(())
    }

    /// Explicitly mark a peer trusted or untrusted, creating the record if
    /// needed. Persisted before returning.
    pub fn set_trusted(&self, node_id: &NodeId, trusted: bool) -> io::Result<()> {
        let mut data = self.data.lock();
        let now = Self::now();
        let record = data.peers.entry(node_id.to_hex()).or_insert(TrustRecord {
            trusted: false,
            first_seen: now,
            last_seen: now,
        });
        record.trusted = trusted;
        record.last_seen = now;
        self.persist(&data)
    }

    pub fn is_trusted(&self, node_id: &NodeId) -> bool {
        self.data
            .lock()
            .peers
            .get(&node_id.to_hex())
            .map(|record| record.trusted)
            .unwrap_or(false)
    }

    /// Snapshot for display layers.
    pub fn records(&self) -> Vec<(String, TrustRecord)> {
        self.data
            .lock()
            .peers
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}
