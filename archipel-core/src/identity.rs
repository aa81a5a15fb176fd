//! Node identity: a 32-byte public identity written as 64 lowercase hex
//! characters on the wire and in every log line.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

/// Raw length of a node id.
pub const NODE_ID_LEN: usize = 32;
/// Length of the canonical hex form.
pub const NODE_ID_HEX_LEN: usize = 64;

/// Public identity of a peer. Ordering is byte-wise, which coincides with
/// lexicographic ordering of the hex form (hex digits are ASCII-ordered), so
/// transcript ordering can compare ids directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Canonical lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Fixed-width wire form: the 64 ASCII hex characters.
    pub fn wire_bytes(&self) -> [u8; NODE_ID_HEX_LEN] {
        let mut out = [0u8; NODE_ID_HEX_LEN];
        out.copy_from_slice(self.to_hex().as_bytes());
        out
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..10].to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error parsing a node id from text.
#[derive(Debug, thiserror::Error)]
#[error("node id must be 64 lowercase hex characters")]
pub struct InvalidNodeId;

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NODE_ID_HEX_LEN
            || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(InvalidNodeId);
        }
        let raw = hex::decode(s).map_err(|_| InvalidNodeId)?;
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(NodeId(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Long-term agreement keypair. Loading a persisted identity from disk is the
/// host's concern; the daemon runs with a fresh keypair per process.
pub struct LocalIdentity {
    secret: StaticSecret,
    node_id: NodeId,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let node_id = NodeId::from_bytes(PublicKey::from(&secret).to_bytes());
        Self { secret, node_id }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }
}
