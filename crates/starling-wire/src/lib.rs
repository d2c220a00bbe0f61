//! Wire-level types for the helios-starling protocol.
//!
//! This crate defines everything that crosses the transport boundary:
//! the universal envelope and its per-type bodies, the kernel error
//! taxonomy, method/topic name grammar, accumulating validators, and the
//! encode/decode/classify codec. It is deliberately free of runtime
//! concerns; the kernel in `starling-core` builds on these types.

mod codec;
mod error;
mod limits;
mod message;
mod names;
mod validate;

pub use codec::*;
pub use error::*;
pub use limits::*;
pub use message::*;
pub use names::*;
pub use validate::*;
