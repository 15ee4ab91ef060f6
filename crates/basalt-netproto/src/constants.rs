/// Maximum number of players in a session. Player 0 is always the host.
pub const MAX_PLAYERS: usize = 2;

/// Control message header length in bytes (wire format).
pub const HEADER_LEN: usize = 4;

/// Length of the NUL-padded nickname field in bytes.
pub const NICKNAME_LEN: usize = 128;

/// Length of the NUL-padded session password field in bytes.
pub const PASSWORD_LEN: usize = 128;

/// Serialized size of one roster entry in a `Reset` message.
pub const PLAYER_ENTRY_LEN: usize = 2 + NICKNAME_LEN + 4 + 2;

/// Upper bound on the snapshot payload carried by a `Reset` message.
/// Protects the receiver from unbounded allocations before decompression.
pub const MAX_STATE_DATA_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on the trailing UTF-8 payload of a chat message.
pub const MAX_CHAT_LEN: usize = 1024;
