//! Request routing
//!
//! Turns a model name into a concrete variant and backend address using the
//! current datastore contents.

pub mod picker;
pub mod query;
pub mod selection;

pub use picker::{BackendPicker, LeastQueuePicker};
pub use query::{RoutingDecision, RoutingError, RoutingQuery};
pub use selection::{classify_criticality, draw_variant, select_variant, RequestPriority};
