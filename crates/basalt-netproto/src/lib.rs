//! Wire formats for basalt netplay.
//!
//! Sessions talk over two logical channels:
//!
//! - **Control**: reliable, ordered session-management traffic. Every
//!   message is a fixed little-endian layout behind a 4-byte header; the
//!   layouts in [`control`] are the ground truth for interoperability.
//! - **Gameplay**: unreliable input-exchange traffic owned by the rollback
//!   engine. Messages are postcard-encoded and only ever produced and
//!   consumed by the engine itself; see [`gameplay`].
//!
//! This crate performs no I/O.

pub mod constants;
pub mod control;
pub mod error;
pub mod gameplay;
pub mod header;

pub use control::ControlMessage;
pub use error::ProtoError;
pub use gameplay::GameplayMessage;
pub use header::{ControlHeader, MessageType};
