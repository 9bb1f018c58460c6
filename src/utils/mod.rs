//! Utility modules

pub mod error;
pub mod wire;

pub use error::{ConnectionError, ProtocolError, Result, TuningError, UsageError};
pub use wire::Message;
