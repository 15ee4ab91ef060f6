//! Typed control-channel messages.
//!
//! Every message is a fixed little-endian layout behind a
//! [`ControlHeader`]; the offsets documented on each `encode`/`decode`
//! pair are the wire ground truth. Receivers reject packets shorter than
//! the fixed portion of the typed message, and packets whose declared
//! header size is smaller than that fixed portion.

use bytes::Bytes;

use crate::{
    constants::{
        HEADER_LEN, MAX_CHAT_LEN, MAX_PLAYERS, MAX_STATE_DATA_SIZE, NICKNAME_LEN, PASSWORD_LEN,
        PLAYER_ENTRY_LEN,
    },
    error::ProtoError,
    header::{ControlHeader, MessageType},
};

/// Connection intent declared by a dialing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectMode {
    Player = 0,
    Spectator = 1,
}

/// Host verdict on a `ConnectRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectResult {
    Success = 0,
    ServerFull = 1,
    PlayerIdInUse = 2,
    SessionClosed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DropReason {
    ConnectTimeout = 0,
    DisconnectedFromHost = 1,
}

impl DropReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ConnectTimeout => "Connection timeout",
            Self::DisconnectedFromHost => "Disconnected from host",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    ConnectionLost = 0,
}

impl ResetReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    HostShutdown = 0,
    Terminated = 1,
}

impl CloseReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::HostShutdown => "Host shut down the session",
            Self::Terminated => "Session was terminated",
        }
    }
}

fn enum_u8(field: &'static str, value: u8, max: u8) -> Result<u8, ProtoError> {
    if value > max {
        return Err(ProtoError::InvalidValue {
            field,
            value: value as u16,
        });
    }
    Ok(value)
}

/// Joiner → host. Fixed layout, 263 bytes:
/// 0..4 header, 4 mode (u8), 5..7 requested_player_id (i16),
/// 7..135 nickname (NUL-padded), 135..263 session_password (NUL-padded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub mode: ConnectMode,
    pub requested_player_id: i16,
    pub nickname: String,
    pub session_password: String,
}

/// Host → joiner. Fixed layout, 7 bytes:
/// 0..4 header, 4 result (u8), 5..7 player_id (i16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: ConnectResult,
    pub player_id: i16,
}

/// One roster slot inside a [`Reset`]. 136 bytes on the wire:
/// 0..2 controller_port (i16, -1 if the slot is empty),
/// 2..130 nickname (NUL-padded), 130..134 host (u32, IPv4 octets),
/// 134..136 port (u16).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerEntry {
    pub controller_port: i16,
    pub nickname: String,
    pub host: u32,
    pub port: u16,
}

impl PlayerEntry {
    pub fn empty() -> Self {
        Self {
            controller_port: -1,
            ..Self::default()
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.controller_port >= 0
    }
}

/// Host → peers: full resynchronization. Fixed portion 286 bytes:
/// 0..4 header, 4..8 cookie (u32), 8..12 state_data_size (u32),
/// 12..14 num_players (u16), 14..286 players (2 × 136-byte entries),
/// then `state_data_size` bytes of compressed machine snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reset {
    pub cookie: u32,
    pub num_players: u16,
    pub players: [PlayerEntry; MAX_PLAYERS],
    pub state: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetComplete {
    pub cookie: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropPlayer {
    pub reason: DropReason,
    pub player_id: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequest {
    pub reason: ResetReason,
    pub causing_player_id: i16,
}

/// Tagged union over every control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Reset(Reset),
    ResetComplete(ResetComplete),
    ResumeSession,
    PlayerJoined { player_id: i16 },
    DropPlayer(DropPlayer),
    ResetRequest(ResetRequest),
    CloseSession { reason: CloseReason },
    Chat { text: String },
}

const CONNECT_REQUEST_LEN: usize = HEADER_LEN + 1 + 2 + NICKNAME_LEN + PASSWORD_LEN;
const CONNECT_RESPONSE_LEN: usize = HEADER_LEN + 1 + 2;
const RESET_FIXED_LEN: usize = HEADER_LEN + 4 + 4 + 2 + MAX_PLAYERS * PLAYER_ENTRY_LEN;
const RESET_COMPLETE_LEN: usize = HEADER_LEN + 4;
const RESUME_SESSION_LEN: usize = HEADER_LEN;
const PLAYER_JOINED_LEN: usize = HEADER_LEN + 2;
const DROP_PLAYER_LEN: usize = HEADER_LEN + 1 + 2;
const RESET_REQUEST_LEN: usize = HEADER_LEN + 1 + 2;
const CLOSE_SESSION_LEN: usize = HEADER_LEN + 1;
const CHAT_FIXED_LEN: usize = HEADER_LEN;

fn put_padded(out: &mut Vec<u8>, text: &str, len: usize) {
    let bytes = text.as_bytes();
    let copy = bytes.len().min(len.saturating_sub(1));
    out.extend_from_slice(&bytes[..copy]);
    out.resize(out.len() + (len - copy), 0);
}

fn read_padded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn read_i16(buf: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectRequest(_) => MessageType::ConnectRequest,
            Self::ConnectResponse(_) => MessageType::ConnectResponse,
            Self::Reset(_) => MessageType::Reset,
            Self::ResetComplete(_) => MessageType::ResetComplete,
            Self::ResumeSession => MessageType::ResumeSession,
            Self::PlayerJoined { .. } => MessageType::PlayerJoined,
            Self::DropPlayer(_) => MessageType::DropPlayer,
            Self::ResetRequest(_) => MessageType::ResetRequest,
            Self::CloseSession { .. } => MessageType::CloseSession,
            Self::Chat { .. } => MessageType::Chat,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let total = match self {
            Self::ConnectRequest(_) => CONNECT_REQUEST_LEN,
            Self::ConnectResponse(_) => CONNECT_RESPONSE_LEN,
            Self::Reset(m) => {
                if m.state.len() > MAX_STATE_DATA_SIZE {
                    return Err(ProtoError::StateTooLarge(m.state.len()));
                }
                RESET_FIXED_LEN + m.state.len()
            }
            Self::ResetComplete(_) => RESET_COMPLETE_LEN,
            Self::ResumeSession => RESUME_SESSION_LEN,
            Self::PlayerJoined { .. } => PLAYER_JOINED_LEN,
            Self::DropPlayer(_) => DROP_PLAYER_LEN,
            Self::ResetRequest(_) => RESET_REQUEST_LEN,
            Self::CloseSession { .. } => CLOSE_SESSION_LEN,
            Self::Chat { text } => {
                if text.len() > MAX_CHAT_LEN {
                    return Err(ProtoError::ChatTooLong(text.len()));
                }
                CHAT_FIXED_LEN + text.len()
            }
        };

        let mut out = Vec::with_capacity(total);
        let mut header = [0u8; HEADER_LEN];
        ControlHeader::new(self.message_type(), total).encode_into(&mut header);
        out.extend_from_slice(&header);

        match self {
            Self::ConnectRequest(m) => {
                out.push(m.mode as u8);
                out.extend_from_slice(&m.requested_player_id.to_le_bytes());
                put_padded(&mut out, &m.nickname, NICKNAME_LEN);
                put_padded(&mut out, &m.session_password, PASSWORD_LEN);
            }
            Self::ConnectResponse(m) => {
                out.push(m.result as u8);
                out.extend_from_slice(&m.player_id.to_le_bytes());
            }
            Self::Reset(m) => {
                out.extend_from_slice(&m.cookie.to_le_bytes());
                out.extend_from_slice(&(m.state.len() as u32).to_le_bytes());
                out.extend_from_slice(&m.num_players.to_le_bytes());
                for entry in &m.players {
                    out.extend_from_slice(&entry.controller_port.to_le_bytes());
                    put_padded(&mut out, &entry.nickname, NICKNAME_LEN);
                    out.extend_from_slice(&entry.host.to_le_bytes());
                    out.extend_from_slice(&entry.port.to_le_bytes());
                }
                out.extend_from_slice(&m.state);
            }
            Self::ResetComplete(m) => {
                out.extend_from_slice(&m.cookie.to_le_bytes());
            }
            Self::ResumeSession => {}
            Self::PlayerJoined { player_id } => {
                out.extend_from_slice(&player_id.to_le_bytes());
            }
            Self::DropPlayer(m) => {
                out.push(m.reason as u8);
                out.extend_from_slice(&m.player_id.to_le_bytes());
            }
            Self::ResetRequest(m) => {
                out.push(m.reason as u8);
                out.extend_from_slice(&m.causing_player_id.to_le_bytes());
            }
            Self::CloseSession { reason } => {
                out.push(*reason as u8);
            }
            Self::Chat { text } => {
                out.extend_from_slice(text.as_bytes());
            }
        }

        debug_assert_eq!(out.len(), total);
        Ok(out)
    }

    /// Decode a complete control packet.
    ///
    /// Enforces, for every message type, that the buffer covers the fixed
    /// portion and that the declared header size is not smaller than it.
    /// For `Reset`, the authoritative length rule is
    /// `buf.len() >= fixed + state_data_size`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let header = ControlHeader::decode(buf)?;
        let msg_type =
            MessageType::from_wire(header.msg_type).ok_or(ProtoError::UnknownType(header.msg_type))?;

        let fixed = match msg_type {
            MessageType::ConnectRequest => CONNECT_REQUEST_LEN,
            MessageType::ConnectResponse => CONNECT_RESPONSE_LEN,
            MessageType::Reset => RESET_FIXED_LEN,
            MessageType::ResetComplete => RESET_COMPLETE_LEN,
            MessageType::ResumeSession => RESUME_SESSION_LEN,
            MessageType::PlayerJoined => PLAYER_JOINED_LEN,
            MessageType::DropPlayer => DROP_PLAYER_LEN,
            MessageType::ResetRequest => RESET_REQUEST_LEN,
            MessageType::CloseSession => CLOSE_SESSION_LEN,
            MessageType::Chat => CHAT_FIXED_LEN,
        };
        if buf.len() < fixed {
            return Err(ProtoError::TooShort);
        }
        if (header.size as usize) < fixed {
            return Err(ProtoError::UndersizedMessage {
                kind: header.msg_type,
                declared: header.size as usize,
                fixed,
            });
        }

        Ok(match msg_type {
            MessageType::ConnectRequest => Self::ConnectRequest(ConnectRequest {
                mode: match enum_u8("mode", buf[4], 1)? {
                    0 => ConnectMode::Player,
                    _ => ConnectMode::Spectator,
                },
                requested_player_id: read_i16(buf, 5),
                nickname: read_padded(&buf[7..7 + NICKNAME_LEN]),
                session_password: read_padded(&buf[7 + NICKNAME_LEN..7 + NICKNAME_LEN + PASSWORD_LEN]),
            }),
            MessageType::ConnectResponse => Self::ConnectResponse(ConnectResponse {
                result: match enum_u8("result", buf[4], 3)? {
                    0 => ConnectResult::Success,
                    1 => ConnectResult::ServerFull,
                    2 => ConnectResult::PlayerIdInUse,
                    _ => ConnectResult::SessionClosed,
                },
                player_id: read_i16(buf, 5),
            }),
            MessageType::Reset => {
                let state_data_size = read_u32(buf, 8) as usize;
                if state_data_size > MAX_STATE_DATA_SIZE {
                    return Err(ProtoError::StateTooLarge(state_data_size));
                }
                let available = buf.len() - RESET_FIXED_LEN;
                if state_data_size > available {
                    return Err(ProtoError::StateSizeMismatch {
                        declared: state_data_size,
                        available,
                    });
                }
                let mut players: [PlayerEntry; MAX_PLAYERS] = Default::default();
                for (i, entry) in players.iter_mut().enumerate() {
                    let at = 14 + i * PLAYER_ENTRY_LEN;
                    entry.controller_port = read_i16(buf, at);
                    entry.nickname = read_padded(&buf[at + 2..at + 2 + NICKNAME_LEN]);
                    entry.host = read_u32(buf, at + 2 + NICKNAME_LEN);
                    entry.port = read_u16(buf, at + 6 + NICKNAME_LEN);
                }
                Self::Reset(Reset {
                    cookie: read_u32(buf, 4),
                    num_players: read_u16(buf, 12),
                    players,
                    state: Bytes::copy_from_slice(
                        &buf[RESET_FIXED_LEN..RESET_FIXED_LEN + state_data_size],
                    ),
                })
            }
            MessageType::ResetComplete => Self::ResetComplete(ResetComplete {
                cookie: read_u32(buf, 4),
            }),
            MessageType::ResumeSession => Self::ResumeSession,
            MessageType::PlayerJoined => Self::PlayerJoined {
                player_id: read_i16(buf, 4),
            },
            MessageType::DropPlayer => Self::DropPlayer(DropPlayer {
                reason: match enum_u8("reason", buf[4], 1)? {
                    0 => DropReason::ConnectTimeout,
                    _ => DropReason::DisconnectedFromHost,
                },
                player_id: read_i16(buf, 5),
            }),
            MessageType::ResetRequest => {
                enum_u8("reason", buf[4], 0)?;
                Self::ResetRequest(ResetRequest {
                    reason: ResetReason::ConnectionLost,
                    causing_player_id: read_i16(buf, 5),
                })
            }
            MessageType::CloseSession => Self::CloseSession {
                reason: match enum_u8("reason", buf[4], 1)? {
                    0 => CloseReason::HostShutdown,
                    _ => CloseReason::Terminated,
                },
            },
            MessageType::Chat => {
                let declared = (header.size as usize).min(buf.len());
                let text = String::from_utf8_lossy(&buf[HEADER_LEN..declared]).into_owned();
                if text.len() > MAX_CHAT_LEN {
                    return Err(ProtoError::ChatTooLong(text.len()));
                }
                Self::Chat { text }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout_is_locked() {
        let msg = ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: -1,
            nickname: "ferris".into(),
            session_password: String::new(),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 263);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 263);
        assert_eq!(bytes[4], 0);
        assert_eq!(i16::from_le_bytes([bytes[5], bytes[6]]), -1);
        assert_eq!(&bytes[7..13], b"ferris");
        assert_eq!(bytes[13], 0);

        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn nickname_longer_than_field_is_truncated() {
        let msg = ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: 1,
            nickname: "x".repeat(200),
            session_password: String::new(),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 263);
        match ControlMessage::decode(&bytes).unwrap() {
            ControlMessage::ConnectRequest(m) => assert_eq!(m.nickname.len(), 127),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reset_roundtrip_with_snapshot() {
        let mut players: [PlayerEntry; MAX_PLAYERS] = Default::default();
        players[0] = PlayerEntry {
            controller_port: 0,
            nickname: "host".into(),
            host: u32::from_le_bytes([127, 0, 0, 1]),
            port: 37000,
        };
        players[1] = PlayerEntry::empty();

        let msg = ControlMessage::Reset(Reset {
            cookie: 7,
            num_players: 1,
            players,
            state: Bytes::from_static(&[1, 2, 3, 4, 5]),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 286 + 5);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn reset_with_overlong_state_size_is_rejected() {
        let msg = ControlMessage::Reset(Reset {
            cookie: 1,
            num_players: 2,
            players: Default::default(),
            state: Bytes::from_static(&[0; 16]),
        });
        let mut bytes = msg.encode().unwrap();
        // Declare more state bytes than the packet carries.
        bytes[8..12].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(ProtoError::StateSizeMismatch { declared: 64, .. })
        ));
    }

    #[test]
    fn undersized_declared_size_is_rejected() {
        let msg = ControlMessage::ResetComplete(ResetComplete { cookie: 3 });
        let mut bytes = msg.encode().unwrap();
        bytes[2..4].copy_from_slice(&4u16.to_le_bytes());
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(ProtoError::UndersizedMessage { .. })
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let bytes = ControlMessage::ConnectResponse(ConnectResponse {
            result: ConnectResult::Success,
            player_id: 1,
        })
        .encode()
        .unwrap();
        assert!(matches!(
            ControlMessage::decode(&bytes[..5]),
            Err(ProtoError::TooShort)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let bytes = [0xAAu8, 0x00, 4, 0];
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(ProtoError::UnknownType(0xAA))
        ));
    }

    #[test]
    fn chat_carries_trailing_utf8() {
        let msg = ControlMessage::Chat {
            text: "glhf ☺".into(),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 4 + "glhf ☺".len());
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn empty_messages_roundtrip() {
        for msg in [
            ControlMessage::ResumeSession,
            ControlMessage::PlayerJoined { player_id: 1 },
            ControlMessage::CloseSession {
                reason: CloseReason::HostShutdown,
            },
            ControlMessage::DropPlayer(DropPlayer {
                reason: DropReason::ConnectTimeout,
                player_id: 1,
            }),
            ControlMessage::ResetRequest(ResetRequest {
                reason: ResetReason::ConnectionLost,
                causing_player_id: 1,
            }),
        ] {
            let bytes = msg.encode().unwrap();
            assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
        }
    }
}
