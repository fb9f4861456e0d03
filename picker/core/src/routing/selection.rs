//! Model Variant Selection
//!
//! Weighted random choice among a model's target variants, plus the
//! criticality classification applied to each request.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::trace;

use super::query::RoutingError;
use crate::datastore::{Criticality, Model};

/// Scheduling priority derived from a model's criticality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Critical,
    Standard,
}

/// Pick a variant with probability proportional to its weight
///
/// With a seed the draw is reproducible; without one the thread-local
/// generator is used.
pub fn select_variant(model: &Model, seed: Option<u64>) -> Result<&str, RoutingError> {
    match seed {
        Some(seed) => draw_variant(model, &mut StdRng::seed_from_u64(seed)),
        None => draw_variant(model, &mut rand::thread_rng()),
    }
}

/// Weighted draw from a caller-supplied generator
pub fn draw_variant<'a, R>(model: &'a Model, rng: &mut R) -> Result<&'a str, RoutingError>
where
    R: Rng + ?Sized,
{
    let total = model.total_weight();
    if total == 0 {
        return Err(RoutingError::NoRoutableVariant(model.name.clone()));
    }

    let mut remaining = rng.gen_range(0..total);
    trace!(model = %model.name, total, draw = remaining, "Drawing model variant");

    for target in &model.targets {
        let weight = u64::from(target.weight);
        if remaining < weight {
            return Ok(&target.name);
        }
        remaining -= weight;
    }

    // Unreachable while the draw stays below the weight sum
    Err(RoutingError::NoRoutableVariant(model.name.clone()))
}

/// Only an explicit `Critical` is critical
pub fn classify_criticality(model: &Model) -> RequestPriority {
    match model.criticality {
        Some(Criticality::Critical) => RequestPriority::Critical,
        _ => RequestPriority::Standard,
    }
}
