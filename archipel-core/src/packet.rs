//! Packet framing: the fixed binary header on every UDP datagram, plus the
//! discovery HELLO payload codec.

use crate::identity::NodeId;

/// 4-byte magic prefix on every datagram.
pub const MAGIC: [u8; 4] = *b"ARCH";
/// Wire protocol version.
pub const VERSION: u8 = 1;
/// Header: magic (4) + version (1) + type (1) + payload length (2, BE).
pub const HEADER_SIZE: usize = 8;
/// The payload length field is a u16.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Datagram types. Room is left in the byte space for future additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Hello,
    HandshakeInit,
    HandshakeResp,
    SecureMsg,
}

impl PacketType {
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Hello => 0x01,
            PacketType::HandshakeInit => 0x02,
            PacketType::HandshakeResp => 0x03,
            PacketType::SecureMsg => 0x04,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(PacketType::Hello),
            0x02 => Some(PacketType::HandshakeInit),
            0x03 => Some(PacketType::HandshakeResp),
            0x04 => Some(PacketType::SecureMsg),
            _ => None,
        }
    }
}

/// Error building a frame.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("payload too large for frame: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Encode a frame: header followed by the payload.
pub fn encode(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(packet_type.as_byte());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one datagram. `None` on anything malformed: short input, wrong
/// magic or version, unknown type, or a length field that disagrees with the
/// trailing bytes. Never panics; callers drop malformed datagrams silently.
pub fn decode(data: &[u8]) -> Option<(PacketType, &[u8])> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    if data[..4] != MAGIC || data[4] != VERSION {
        return None;
    }
    let packet_type = PacketType::from_byte(data[5])?;
    let declared = u16::from_be_bytes([data[6], data[7]]) as usize;
    let payload = &data[HEADER_SIZE..];
    if payload.len() != declared {
        return None;
    }
    Some((packet_type, payload))
}

/// Build the HELLO payload: `<node_id>|<secure_port>`, UTF-8.
pub fn encode_hello(node_id: &NodeId, secure_port: u16) -> Vec<u8> {
    format!("{}|{}", node_id, secure_port).into_bytes()
}

/// Parse a HELLO payload. The advertised secure port is optional so bare-id
/// beacons from minimal senders still register.
pub fn parse_hello(payload: &[u8]) -> Option<(NodeId, Option<u16>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.splitn(2, '|');
    let id: NodeId = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(port) => Some((id, Some(port.parse().ok()?))),
        None => Some((id, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    #[test]
    fn roundtrip_all_types() {
        for packet_type in [
            PacketType::Hello,
            PacketType::HandshakeInit,
            PacketType::HandshakeResp,
            PacketType::SecureMsg,
        ] {
            let frame = encode(packet_type, b"payload").unwrap();
            let (decoded_type, payload) = decode(&frame).unwrap();
            assert_eq!(decoded_type, packet_type);
            assert_eq!(payload, b"payload");
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let frame = encode(PacketType::Hello, b"").unwrap();
        let (_, payload) = decode(&frame).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn rejects_short_input() {
        assert!(decode(b"ARC").is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode(PacketType::Hello, b"x").unwrap();
        frame[0] = b'Z';
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn rejects_bad_version() {
        let mut frame = encode(PacketType::Hello, b"x").unwrap();
        frame[4] = VERSION + 1;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut frame = encode(PacketType::Hello, b"x").unwrap();
        frame[5] = 0x7f;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn rejects_length_mismatch() {
        let frame = encode(PacketType::SecureMsg, b"hello").unwrap();
        // Truncated body.
        assert!(decode(&frame[..frame.len() - 1]).is_none());
        // Extra trailing bytes.
        let mut padded = frame.clone();
        padded.push(0);
        assert!(decode(&padded).is_none());
    }

    #[test]
    fn rejects_oversize_payload() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            encode(PacketType::SecureMsg, &payload),
            Err(PacketError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn hello_roundtrip_with_port() {
        let id = LocalIdentity::generate().node_id();
        let payload = encode_hello(&id, 6001);
        let (parsed, port) = parse_hello(&payload).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(port, Some(6001));
    }

    #[test]
    fn hello_accepts_bare_id() {
        let id = LocalIdentity::generate().node_id();
        let (parsed, port) = parse_hello(id.to_hex().as_bytes()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(port, None);
    }

    #[test]
    fn hello_rejects_garbage() {
        assert!(parse_hello(b"not-an-id").is_none());
        assert!(parse_hello(&[0xff, 0xfe]).is_none());
        let id = LocalIdentity::generate().node_id();
        let bad_port = format!("{}|oops", id);
        assert!(parse_hello(bad_port.as_bytes()).is_none());
    }
}
