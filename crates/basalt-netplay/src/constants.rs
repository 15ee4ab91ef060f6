use std::time::Duration;

pub use basalt_netproto::constants::MAX_PLAYERS;

/// Deepest speculative execution before `synchronize_input` stalls.
pub const MAX_ROLLBACK_FRAMES: u32 = 8;

/// Logical transport channels: control and gameplay.
pub const NUM_CHANNELS: usize = 2;

/// Wall-clock budget for connecting to the host, and for the host to see
/// every peer acknowledge a reset.
pub const MAX_CONNECT_TIME: Duration = Duration::from_secs(15);

/// Connection attempts made to the host within `MAX_CONNECT_TIME`.
pub const MAX_CONNECT_RETRIES: u32 = 4;

/// Drain budget when closing a session before dropping remaining peers.
pub const MAX_CLOSE_TIME: Duration = Duration::from_secs(3);

/// Desync checksum window: 4 pages of 4 KiB.
pub const DESYNC_WINDOW_SIZE: usize = 4096 * 4;

/// Sleep slice used by the throttle loop; the transport is polled once
/// per slice so ping and rollback traffic keep flowing.
pub const THROTTLE_SLEEP_SLICE: Duration = Duration::from_millis(2);
