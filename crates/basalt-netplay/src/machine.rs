//! The emulated machine as seen by the netplay session.
//!
//! The session only ever needs to run single frames, move state in and out
//! of memory snapshots, and mute audio while it replays history. Disc
//! booting, rendering, and save-state files stay on the host side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("snapshot save failed: {0}")]
    Save(String),
    #[error("snapshot load failed: {0}")]
    Load(String),
    #[error("state serialization failed: {0}")]
    Serialize(String),
    #[error("state deserialization failed: {0}")]
    Deserialize(String),
}

/// In-memory machine state for one frame. Buffers are pooled by the
/// session and reused across frames, so `data` keeps its capacity.
#[derive(Debug, Default)]
pub struct MachineSnapshot {
    pub data: Vec<u8>,
}

pub trait Machine {
    /// Advance the machine by exactly one frame using the current
    /// controller bind states.
    fn run_frame(&mut self);

    /// Frames executed since boot.
    fn frame_number(&self) -> u32;

    /// Nominal presentation rate used for frame pacing.
    fn throttle_hz(&self) -> f64;

    /// Serialize the full machine state into `out.data` (cleared first).
    fn save_snapshot(&mut self, out: &mut MachineSnapshot) -> Result<(), MachineError>;

    fn load_snapshot(&mut self, snapshot: &MachineSnapshot) -> Result<(), MachineError>;

    /// Full save-state bytes for resynchronization. Unlike the per-frame
    /// snapshots this must be self-contained across processes.
    fn serialize_state(&mut self) -> Result<Vec<u8>, MachineError>;

    fn deserialize_state(&mut self, data: &[u8]) -> Result<(), MachineError>;

    /// Mute audio output; set while rollback replay is executing frames.
    fn set_audio_muted(&mut self, muted: bool);

    /// Apply one digital button state to a controller slot.
    fn set_button_state(&mut self, slot: usize, button: usize, pressed: bool);

    /// Present the last rendered frame. No-op for headless machines.
    fn present_frame(&mut self) {}
}
