//! OpMix Core - Foundation types for the operator audio engine
//!
//! This crate provides the types shared by every OpMix crate:
//! - Error handling (`OpMixError`, `Result`)
//! - Stable node identities derived from graph paths (`NodeId`)
//! - Rational frame timing for offline export (`FrameRate`)

pub mod error;
pub mod id;
pub mod time;

pub use error::{OpMixError, Result};
pub use id::NodeId;
pub use time::FrameRate;
