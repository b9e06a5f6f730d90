//! sermux-core: codec layer for the sermux serial multiplexer.
//!
//! This crate defines the pieces that touch bytes but never touch a device:
//! - Frame type and 16-byte wire header ([`Frame`])
//! - STX/ETX/DLE byte stuffing and the streaming delimiter scanner
//!   ([`stuff`], [`unstuff`], [`FrameScanner`])
//! - The self-describing typed payload map used by control messages
//!   ([`VarMap`], [`Value`])
//! - Error kinds ([`FrameError`], [`MapError`])
//!
//! Everything here is runtime-agnostic; the async engine lives in `sermux`.

mod error;
mod frame;
mod stuffing;
mod value;
mod varmap;
mod wire;

pub use error::*;
pub use frame::*;
pub use stuffing::*;
pub use value::*;
pub use varmap::*;
pub use wire::*;
