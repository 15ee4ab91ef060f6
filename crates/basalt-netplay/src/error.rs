//! Netplay error types.

use thiserror::Error;

use crate::machine::MachineError;

#[derive(Debug, Error)]
pub enum NetplayError {
    #[error("failed to resolve host address '{0}'")]
    AddressResolve(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] basalt_netproto::ProtoError),

    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("not synchronized with all peers yet")]
    NotSynchronized,

    #[error("prediction window exhausted, waiting for remote inputs")]
    PredictionThreshold,

    #[error("invalid player handle {0}")]
    InvalidHandle(usize),

    #[error("no saved state for frame {0}")]
    MissingSnapshot(i32),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(std::io::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer table full")]
    PeerTableFull,

    #[error("unknown or dead peer")]
    InvalidPeer,

    #[error("payload of {0} bytes exceeds the channel limit")]
    PayloadTooLarge(usize),
}
