//! Datagram framing for the UDP endpoint.

use crate::error::TransportError;

/// Magic bytes at the beginning of every datagram. Quickly rejects
/// unrelated traffic on the port.
pub const MAGIC: [u8; 2] = *b"BS";

/// Transport wire version; mismatching datagrams are dropped.
pub const VERSION: u8 = 1;

/// Fixed datagram header length in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest datagram we emit, kept under typical path MTU.
pub const MAX_DATAGRAM: usize = 1200;

/// Payload bytes per fragment of a reliable message.
pub const FRAGMENT_PAYLOAD: usize = 1024;

/// Set on every reliable fragment except the last one of a message.
pub const FLAG_FRAGMENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Connection request; payload is a u32 user-data word.
    Connect = 0,
    ConnectAck = 1,
    /// Channel payload, sequenced per channel.
    Payload = 2,
    /// Acknowledges a reliable payload sequence number.
    Ack = 3,
    KeepAlive = 4,
    /// Graceful teardown notice.
    Disconnect = 5,
}

impl PacketKind {
    fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Connect,
            1 => Self::ConnectAck,
            2 => Self::Payload,
            3 => Self::Ack,
            4 => Self::KeepAlive,
            5 => Self::Disconnect,
            _ => return None,
        })
    }
}

/// Datagram header. Offsets (bytes):
/// - 0..2  magic
/// - 2     version
/// - 3     kind
/// - 4     flags
/// - 5     channel
/// - 6..10 sequence number (u32 LE; 0 for unsequenced kinds)
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub flags: u8,
    pub channel: u8,
    pub seq: u32,
}

impl PacketHeader {
    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < HEADER_LEN || buf[0..2] != MAGIC || buf[2] != VERSION {
            return None;
        }
        let kind = PacketKind::from_wire(buf[3])?;
        Some((
            Self {
                kind,
                flags: buf[4],
                channel: buf[5],
                seq: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            },
            &buf[HEADER_LEN..],
        ))
    }
}

/// Assemble a datagram. Payloads beyond the MTU budget are the caller's
/// bug for unreliable traffic and impossible for reliable fragments.
pub fn build_datagram(
    kind: PacketKind,
    flags: u8,
    channel: u8,
    seq: u32,
    payload: &[u8],
) -> Result<Vec<u8>, TransportError> {
    if HEADER_LEN + payload.len() > MAX_DATAGRAM {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(kind as u8);
    out.push(flags);
    out.push(channel);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_layout_is_locked() {
        let bytes = build_datagram(PacketKind::Payload, FLAG_FRAGMENT, 1, 0x0403_0201, b"hi")
            .unwrap();
        assert_eq!(&bytes[0..2], b"BS");
        assert_eq!(bytes[2], VERSION);
        assert_eq!(bytes[3], PacketKind::Payload as u8);
        assert_eq!(bytes[4], FLAG_FRAGMENT);
        assert_eq!(bytes[5], 1);
        assert_eq!(&bytes[6..10], &[1, 2, 3, 4]);
        assert_eq!(&bytes[10..], b"hi");

        let (header, payload) = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(header.kind, PacketKind::Payload);
        assert_eq!(header.seq, 0x0403_0201);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn foreign_traffic_is_dropped() {
        assert!(PacketHeader::decode(b"XX\x01\x02\x00\x00\x00\x00\x00\x00").is_none());
        assert!(PacketHeader::decode(b"BS\x09\x02\x00\x00\x00\x00\x00\x00").is_none());
        assert!(PacketHeader::decode(b"BS\x01\x77\x00\x00\x00\x00\x00\x00").is_none());
        assert!(PacketHeader::decode(b"BS\x01").is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_DATAGRAM];
        assert!(build_datagram(PacketKind::Payload, 0, 1, 0, &payload).is_err());
    }
}
