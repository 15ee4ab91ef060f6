//! Rollback netplay for the basalt emulator.
//!
//! A session lets a small fixed number of peers run the same
//! deterministic machine in lockstep: local inputs apply the instant they
//! are pressed, remote inputs are predicted, and history is rewound and
//! replayed when the real inputs arrive. Everything runs cooperatively on
//! the caller's thread; the only waits are deadlines handed to the
//! transport and the throttle's short poll-sleeps.
//!
//! # Architecture
//!
//! - [`transport`]: UDP endpoint with a reliable control channel and an
//!   unreliable gameplay channel
//! - [`session`]: the session state machine, resync orchestration, and
//!   outer loop
//! - [`rollback`]: the predict/advance/correct engine
//! - [`pacing`]: adaptive frame pacing driven by timesync events
//! - [`machine`] / [`host`]: the seams to the emulated machine and the
//!   hosting application
//! - [`error`]: error types

pub mod constants;
pub mod error;
pub mod host;
pub mod input;
pub mod machine;
pub mod pacing;
pub mod rollback;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use error::{NetplayError, TransportError};
pub use host::{HostInterface, SessionSettings};
pub use input::{InputCollector, NetInput};
pub use machine::{Machine, MachineError, MachineSnapshot};
pub use rollback::{Frame, RollbackSession, SessionEvent, SessionHandler};
pub use session::{NetplaySession, SessionOptions, SessionState};
pub use transport::{channel::Channel, Endpoint, PeerId, TransportEvent};
