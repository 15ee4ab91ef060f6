use crate::{constants::HEADER_LEN, error::ProtoError};

/// Control message kinds, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    ConnectRequest = 0,
    ConnectResponse = 1,
    Reset = 2,
    ResetComplete = 3,
    ResumeSession = 4,
    PlayerJoined = 5,
    DropPlayer = 6,
    ResetRequest = 7,
    CloseSession = 8,
    Chat = 9,
}

impl MessageType {
    pub fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::ConnectRequest,
            1 => Self::ConnectResponse,
            2 => Self::Reset,
            3 => Self::ResetComplete,
            4 => Self::ResumeSession,
            5 => Self::PlayerJoined,
            6 => Self::DropPlayer,
            7 => Self::ResetRequest,
            8 => Self::CloseSession,
            9 => Self::Chat,
            _ => return None,
        })
    }
}

/// Header prefixed to every control message.
///
/// Encoding rules:
/// - Fixed size: exactly `HEADER_LEN` bytes, little-endian fields.
/// - Offsets: 0..2 message type (u16), 2..4 size (u16).
/// - `size` is the complete message length including this header and any
///   trailing payload (snapshot bytes, chat bytes). Messages whose total
///   length exceeds `u16::MAX` (a `Reset` carrying a large snapshot)
///   saturate the field; the receiver's authoritative length check for
///   those is the message's own size field plus the datagram length.
#[derive(Debug, Clone, Copy)]
pub struct ControlHeader {
    pub msg_type: u16,
    pub size: u16,
}

impl ControlHeader {
    pub const LEN: usize = HEADER_LEN;

    pub fn new(msg_type: MessageType, total_size: usize) -> Self {
        Self {
            msg_type: msg_type as u16,
            size: u16::try_from(total_size).unwrap_or(u16::MAX),
        }
    }

    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        out[2..4].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Decode the header from the front of `buf`. The remainder of the
    /// message is not validated here; typed decoders enforce the
    /// declared-size and fixed-portion rules.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::TooShort);
        }
        Ok(Self {
            msg_type: u16::from_le_bytes([buf[0], buf[1]]),
            size: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}

/// Peek the message type of a control packet without decoding the body.
/// Used by receivers to decide whether a malformed packet is fatal
/// (`Reset`) or merely discarded.
pub fn peek_message_type(buf: &[u8]) -> Option<MessageType> {
    let header = ControlHeader::decode(buf).ok()?;
    MessageType::from_wire(header.msg_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_locked() {
        let h = ControlHeader::new(MessageType::DropPlayer, 0x1234);
        let mut buf = [0u8; HEADER_LEN];
        h.encode_into(&mut buf);

        assert_eq!(buf, [6, 0, 0x34, 0x12]);

        let decoded = ControlHeader::decode(&buf).unwrap();
        assert_eq!(decoded.msg_type, MessageType::DropPlayer as u16);
        assert_eq!(decoded.size, 0x1234);
    }

    #[test]
    fn oversized_total_saturates() {
        let h = ControlHeader::new(MessageType::Reset, 4 * 1024 * 1024);
        assert_eq!(h.size, u16::MAX);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(ControlHeader::decode(&[1, 0, 4]).is_err());
        assert!(peek_message_type(&[9, 0]).is_none());
    }

    #[test]
    fn peek_reports_known_types_only() {
        assert_eq!(peek_message_type(&[2, 0, 8, 0]), Some(MessageType::Reset));
        assert_eq!(peek_message_type(&[99, 0, 4, 0]), None);
    }
}
