//! Variable binding layer
//!
//! Maps (bundle, name) pairs to library-owned typed storage. The application
//! holds `TunableCell` handles and reads its variables directly; the session
//! applies server-chosen values through the binding table, which is the only
//! write path besides the application itself.

pub mod storage;
pub mod table;
pub mod value;

pub use storage::TunableCell;
pub use value::{MetricValue, TunableType, TunableValue};

pub(crate) use table::BindingTable;
