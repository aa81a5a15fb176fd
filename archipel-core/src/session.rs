//! Handshake cryptography and the SECURE_MSG payload: X25519 ephemerals,
//! transcript-salted HKDF key derivation, and ChaCha20-Poly1305 sealing with
//! an independent HMAC over the sealed parts.

use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::identity::{NodeId, NODE_ID_HEX_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Application context string fed into HKDF expansion.
const SESSION_CONTEXT: &[u8] = b"archipel-session-v1";

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
/// SECURE_MSG layout: sender id (64 ASCII hex) + nonce + tag + mac, then the
/// ciphertext.
pub const SECURE_HEADER_LEN: usize = NODE_ID_HEX_LEN + NONCE_LEN + TAG_LEN + MAC_LEN;

/// Per-peer session keys derived from a completed handshake.
#[derive(Clone)]
pub struct SessionKeys {
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
}

/// Fresh ephemeral keypair for one handshake exchange.
pub fn generate_ephemeral() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Handshake transcript: both ids then both ephemeral publics, each pair
/// ordered by node id value so initiator and responder produce identical
/// bytes regardless of who started.
pub fn build_transcript(
    local_id: &NodeId,
    remote_id: &NodeId,
    local_pub: &PublicKey,
    remote_pub: &PublicKey,
) -> Vec<u8> {
    let (first_id, second_id, first_pub, second_pub) = if local_id <= remote_id {
        (local_id, remote_id, local_pub, remote_pub)
    } else {
        (remote_id, local_id, remote_pub, local_pub)
    };
    let mut transcript = Vec::with_capacity(2 * NODE_ID_HEX_LEN + 64);
    transcript.extend_from_slice(&first_id.wire_bytes());
    transcript.extend_from_slice(&second_id.wire_bytes());
    transcript.extend_from_slice(first_pub.as_bytes());
    transcript.extend_from_slice(second_pub.as_bytes());
    transcript
}

/// Expand the shared secret into an encryption key and a MAC key, salted
/// with the transcript hash.
pub fn derive_session_keys(shared_secret: &[u8; 32], transcript: &[u8]) -> SessionKeys {
    let salt: [u8; 32] = Sha256::digest(transcript).into();
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = [0u8; 64];
    hkdf.expand(SESSION_CONTEXT, &mut okm)
        .expect("64 bytes is a valid hkdf-sha256 output length");
    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    SessionKeys { enc_key, mac_key }
}

/// Initiator-side state: the ephemeral private key waiting for the peer's
/// HANDSHAKE_RESP.
pub struct PendingHandshake {
    secret: EphemeralSecret,
    public: PublicKey,
    started: Instant,
}

impl PendingHandshake {
    pub fn new() -> Self {
        let (secret, public) = generate_ephemeral();
        Self {
            secret,
            public,
            started: Instant::now(),
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finish the exchange with the responder's ephemeral public key.
    pub fn complete(
        self,
        local_id: &NodeId,
        remote_id: &NodeId,
        remote_pub: &PublicKey,
    ) -> SessionKeys {
        let transcript = build_transcript(local_id, remote_id, &self.public, remote_pub);
        let shared = self.secret.diffie_hellman(remote_pub);
        derive_session_keys(shared.as_bytes(), &transcript)
    }
}

impl Default for PendingHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder side: derive session keys against the initiator's ephemeral and
/// hand back our ephemeral public key for the HANDSHAKE_RESP.
pub fn respond_to_init(
    local_id: &NodeId,
    remote_id: &NodeId,
    remote_pub: &PublicKey,
) -> (SessionKeys, PublicKey) {
    let (secret, public) = generate_ephemeral();
    let transcript = build_transcript(local_id, remote_id, &public, remote_pub);
    let shared = secret.diffie_hellman(remote_pub);
    (derive_session_keys(shared.as_bytes(), &transcript), public)
}

/// One encrypted message as carried by SECURE_MSG.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedMessage {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub mac: [u8; MAC_LEN],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionCryptoError {
    #[error("invalid session key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("mac mismatch")]
    Mac,
    #[error("aead authentication failed")]
    Aead,
}

/// Encrypt a plaintext under the session keys: AEAD with a random 96-bit
/// nonce, then an independent HMAC over nonce || ciphertext || tag.
pub fn seal(keys: &SessionKeys, plaintext: &[u8]) -> Result<SealedMessage, SessionCryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(&keys.enc_key).map_err(|_| SessionCryptoError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SessionCryptoError::Encrypt)?;
    // The AEAD appends its 16-byte tag to the ciphertext; the wire carries
    // them as separate fields.
    let tag_at = sealed.len() - TAG_LEN;
    let tag_vec = sealed.split_off(tag_at);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_vec);
    let mac = compute_mac(&keys.mac_key, &nonce, &sealed, &tag)?;
    Ok(SealedMessage {
        nonce,
        tag,
        mac,
        ciphertext: sealed,
    })
}

/// Verify both authenticators and decrypt. The HMAC comparison is
/// constant-time; either failure discards the message.
pub fn open(keys: &SessionKeys, message: &SealedMessage) -> Result<Vec<u8>, SessionCryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&keys.mac_key).map_err(|_| SessionCryptoError::Key)?;
    mac.update(&message.nonce);
    mac.update(&message.ciphertext);
    mac.update(&message.tag);
    mac.verify_slice(&message.mac)
        .map_err(|_| SessionCryptoError::Mac)?;

    let cipher =
        ChaCha20Poly1305::new_from_slice(&keys.enc_key).map_err(|_| SessionCryptoError::Key)?;
    let mut sealed = Vec::with_capacity(message.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&message.ciphertext);
    sealed.extend_from_slice(&message.tag);
    cipher
        .decrypt(Nonce::from_slice(&message.nonce), sealed.as_slice())
        .map_err(|_| SessionCryptoError::Aead)
}

fn compute_mac(
    mac_key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<[u8; MAC_LEN], SessionCryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| SessionCryptoError::Key)?;
    mac.update(nonce);
    mac.update(ciphertext);
    mac.update(tag);
    Ok(mac.finalize().into_bytes().into())
}

/// Serialize a sealed message behind the fixed-width sender id.
pub fn pack_secure_payload(sender: &NodeId, message: &SealedMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECURE_HEADER_LEN + message.ciphertext.len());
    out.extend_from_slice(&sender.wire_bytes());
    out.extend_from_slice(&message.nonce);
    out.extend_from_slice(&message.tag);
    out.extend_from_slice(&message.mac);
    out.extend_from_slice(&message.ciphertext);
    out
}

/// Split a SECURE_MSG payload into sender id and sealed message. `None` when
/// the payload is shorter than the header or the id is not valid hex.
pub fn unpack_secure_payload(payload: &[u8]) -> Option<(NodeId, SealedMessage)> {
    if payload.len() < SECURE_HEADER_LEN {
        return None;
    }
    let id_text = std::str::from_utf8(&payload[..NODE_ID_HEX_LEN]).ok()?;
    let sender: NodeId = id_text.parse().ok()?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[64..76]);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&payload[76..92]);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&payload[92..124]);
    Some((
        sender,
        SealedMessage {
            nonce,
            tag,
            mac,
            ciphertext: payload[SECURE_HEADER_LEN..].to_vec(),
        },
    ))
}

/// Handshake payload body: sender id plus hex-encoded ephemeral public key,
/// carried as JSON inside HANDSHAKE_INIT / HANDSHAKE_RESP frames.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    pub from_id: NodeId,
    pub eph_pub: String,
}

impl HandshakeEnvelope {
    pub fn new(from_id: NodeId, ephemeral: &PublicKey) -> Self {
        Self {
            from_id,
            eph_pub: hex::encode(ephemeral.as_bytes()),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    /// Decode the ephemeral public key, rejecting anything but 32 hex bytes.
    pub fn public_key(&self) -> Option<PublicKey> {
        let raw = hex::decode(&self.eph_pub).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(PublicKey::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    fn two_ids() -> (NodeId, NodeId) {
        (
            LocalIdentity::generate().node_id(),
            LocalIdentity::generate().node_id(),
        )
    }

    #[test]
    fn transcript_is_role_independent() {
        let (a, b) = two_ids();
        let (_, pa) = generate_ephemeral();
        let (_, pb) = generate_ephemeral();
        let from_a = build_transcript(&a, &b, &pa, &pb);
        let from_b = build_transcript(&b, &a, &pb, &pa);
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn both_roles_derive_identical_keys() {
        let (a, b) = two_ids();
        let pending = PendingHandshake::new();
        let initiator_pub = *pending.public();

        let (responder_keys, responder_pub) = respond_to_init(&b, &a, &initiator_pub);
        let initiator_keys = pending.complete(&a, &b, &responder_pub);

        assert_eq!(initiator_keys.enc_key, responder_keys.enc_key);
        assert_eq!(initiator_keys.mac_key, responder_keys.mac_key);
    }

    #[test]
    fn distinct_handshakes_yield_distinct_keys() {
        let (a, b) = two_ids();
        let first = {
            let pending = PendingHandshake::new();
            let (_, resp_pub) = respond_to_init(&b, &a, pending.public());
            pending.complete(&a, &b, &resp_pub)
        };
        let second = {
            let pending = PendingHandshake::new();
            let (_, resp_pub) = respond_to_init(&b, &a, pending.public());
            pending.complete(&a, &b, &resp_pub)
        };
        assert_ne!(first.enc_key, second.enc_key);
    }

    fn session_keys() -> SessionKeys {
        let (a, b) = two_ids();
        let pending = PendingHandshake::new();
        let (_, resp_pub) = respond_to_init(&b, &a, pending.public());
        pending.complete(&a, &b, &resp_pub)
    }

    #[test]
    fn seal_open_roundtrip() {
        let keys = session_keys();
        let sealed = seal(&keys, b"bonjour").unwrap();
        assert_eq!(open(&keys, &sealed).unwrap(), b"bonjour");
    }

    #[test]
    fn any_bit_flip_fails() {
        let keys = session_keys();
        let sealed = seal(&keys, b"integrity matters").unwrap();

        let mut bad = sealed.clone();
        bad.nonce[0] ^= 1;
        assert!(open(&keys, &bad).is_err());

        let mut bad = sealed.clone();
        bad.ciphertext[0] ^= 1;
        assert!(open(&keys, &bad).is_err());

        let mut bad = sealed.clone();
        bad.tag[0] ^= 1;
        assert!(open(&keys, &bad).is_err());

        let mut bad = sealed.clone();
        bad.mac[0] ^= 1;
        assert!(matches!(open(&keys, &bad), Err(SessionCryptoError::Mac)));
    }

    #[test]
    fn wrong_keys_fail() {
        let keys = session_keys();
        let other = session_keys();
        let sealed = seal(&keys, b"for your eyes only").unwrap();
        assert!(open(&other, &sealed).is_err());
    }

    #[test]
    fn secure_payload_roundtrip() {
        let keys = session_keys();
        let sender = LocalIdentity::generate().node_id();
        let sealed = seal(&keys, b"payload").unwrap();
        let packed = pack_secure_payload(&sender, &sealed);
        let (parsed_sender, parsed) = unpack_secure_payload(&packed).unwrap();
        assert_eq!(parsed_sender, sender);
        assert_eq!(parsed, sealed);
    }

    #[test]
    fn secure_payload_rejects_short_or_bad_id() {
        assert!(unpack_secure_payload(&[0u8; SECURE_HEADER_LEN - 1]).is_none());
        let mut payload = vec![b'z'; SECURE_HEADER_LEN + 4];
        payload[..64].fill(b'z');
        assert!(unpack_secure_payload(&payload).is_none());
    }

    #[test]
    fn handshake_envelope_roundtrip() {
        let id = LocalIdentity::generate().node_id();
        let (_, public) = generate_ephemeral();
        let envelope = HandshakeEnvelope::new(id, &public);
        let payload = serde_json::to_vec(&envelope).unwrap();
        let parsed = HandshakeEnvelope::from_payload(&payload).unwrap();
        assert_eq!(parsed.from_id, id);
        assert_eq!(parsed.public_key().unwrap().as_bytes(), public.as_bytes());
    }

    #[test]
    fn handshake_envelope_rejects_bad_key() {
        let id = LocalIdentity::generate().node_id();
        let envelope = HandshakeEnvelope {
            from_id: id,
            eph_pub: "abcd".to_string(),
        };
        assert!(envelope.public_key().is_none());
    }
}
