//! Reconciliation
//!
//! ```text
//!   ChangeEvent ──> ChangeDispatcher ──┬──> WorkQueue ──> PoolReconciler ───────┐
//!                                      ├──> WorkQueue ──> ModelReconciler ──────┼──> Datastore
//!                                      └──> WorkQueue ──> MembershipReconciler ─┘
//! ```
//!
//! Each loop runs independently; nothing orders one loop's writes against
//! another's. The one hand-off: a pool selector change re-queues the
//! membership, whose endpoints are filtered by that selector.

pub mod dispatch;
pub mod membership;
pub mod model;
pub mod pool;
pub mod queue;
pub mod rate_limit;
pub mod reconciler;

pub use dispatch::ChangeDispatcher;
pub use membership::MembershipReconciler;
pub use model::ModelReconciler;
pub use pool::PoolReconciler;
pub use queue::WorkQueue;
pub use rate_limit::{
    default_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOfRateLimiter, RateLimiter,
};
pub use reconciler::{ReconcileLoop, ReconcileMetrics, Reconciler, SyncError};
