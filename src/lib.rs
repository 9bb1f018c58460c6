//! autotune-client library
//!
//! Client-side runtime for an online parameter-tuning server. A long-running
//! application opens one or more sessions, binds tunable variables to
//! library-owned storage cells, reports measured performance, and pulls
//! server-chosen assignments through a blocking request-all barrier or an
//! asynchronous listener, depending on the session's update mode.

pub mod binding;
pub mod client;
pub mod config;
pub mod sync;
pub mod utils;

pub use binding::{MetricValue, TunableCell, TunableType, TunableValue};
pub use client::{SessionHandle, SessionRegistry, SessionState};
pub use config::{ApplicationDescription, ServerAddress, SessionOptions};
pub use sync::UpdateMode;
pub use utils::{ConnectionError, ProtocolError, Result, TuningError, UsageError};
