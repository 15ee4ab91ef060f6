//! Gameplay-channel messages exchanged by the rollback engine.
//!
//! These datagrams are unreliable and engine-internal; peers other than
//! the two rollback endpoints never interpret them. The encoding is
//! postcard, so the layout is free to evolve with the engine.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Upper bound on the per-frame inputs carried by one [`InputBatch`].
pub const MAX_INPUT_BATCH: usize = 64;

/// A batch of local inputs for consecutive frames, resent until acked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBatch {
    /// Frame number of `inputs[0]`.
    pub start_frame: i32,
    /// Highest remote frame the sender has consumed (its ack to us).
    pub ack_frame: i32,
    /// How many frames the sender believes it is ahead of us.
    pub frame_advantage: i32,
    /// One button bitfield per consecutive frame.
    pub inputs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameplayMessage {
    /// Synchronization probe; the peer echoes `random` back.
    SyncRequest { random: u32 },
    SyncReply { random: u32 },
    Input(InputBatch),
    /// Periodic link-quality probe. `ping` is the sender's millisecond
    /// clock, echoed back verbatim in `QualityReply`.
    QualityReport { frame_advantage: i32, ping: u64 },
    QualityReply { pong: u64 },
    /// Desync detection: checksum of the sender's state at the start of a
    /// confirmed frame.
    ChecksumReport { frame: i32, checksum: u32 },
    KeepAlive,
}

impl GameplayMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        Ok(postcard::from_bytes(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_batch_roundtrip() {
        let msg = GameplayMessage::Input(InputBatch {
            start_frame: 120,
            ack_frame: 117,
            frame_advantage: -2,
            inputs: vec![0x0001, 0x0041, 0x0041],
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(GameplayMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn sync_and_quality_roundtrip() {
        for msg in [
            GameplayMessage::SyncRequest { random: 0xDEAD },
            GameplayMessage::SyncReply { random: 0xDEAD },
            GameplayMessage::QualityReport {
                frame_advantage: 3,
                ping: 123_456,
            },
            GameplayMessage::QualityReply { pong: 123_456 },
            GameplayMessage::ChecksumReport {
                frame: 90,
                checksum: 0xABCD_EF01,
            },
            GameplayMessage::KeepAlive,
        ] {
            let bytes = msg.encode().unwrap();
            assert_eq!(GameplayMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(GameplayMessage::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
