//! Synchronization layer: the request-all barrier and the delivery
//! dispatcher for asynchronously received value batches.

pub mod barrier;
pub mod dispatcher;

pub use dispatcher::UpdateMode;
