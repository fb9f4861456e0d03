//! Backend choice among a pool's registered backends

use std::sync::Arc;

use crate::datalayer::plugins::QUEUED_REQUESTS;
use crate::datalayer::{DataPlugin, TelemetryContract, TelemetryType};
use crate::datastore::Backend;

/// Chooses one backend for a request
///
/// Pickers are telemetry consumers: the keys they read are declared through
/// [`DataPlugin::consumes`] and validated when the dependency graph is built.
pub trait BackendPicker: DataPlugin {
    /// `backends` is ordered by address; `None` if none is eligible
    fn pick(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// Prefers the backend with the shortest request queue
///
/// Backends that have not reported telemetry yet rank after every measured
/// backend. Ties go to the lowest address.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastQueuePicker;

impl LeastQueuePicker {
    pub const NAME: &'static str = "least-queue-picker";
}

impl DataPlugin for LeastQueuePicker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn consumes(&self) -> TelemetryContract {
        TelemetryContract::new().with(QUEUED_REQUESTS, TelemetryType::Integer)
    }
}

impl BackendPicker for LeastQueuePicker {
    fn pick(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        backends
            .iter()
            .min_by_key(|backend| {
                let queued = backend
                    .telemetry
                    .as_ref()
                    .and_then(|t| t.integer(QUEUED_REQUESTS));
                (queued.is_none(), queued.unwrap_or(0), backend.address.clone())
            })
            .cloned()
    }
}
