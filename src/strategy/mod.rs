//! Layer S: search strategies. A strategy is a first-class object behind
//! one capability -- `generate` -- so the beam and strike variants share a
//! contract without an inheritance hierarchy. Candidate normalization
//! ([`crate::candidate::normalize_all`]) is shared by every strategy and
//! applied once fan-out finishes.

pub mod beam;
pub mod prompt;
pub mod strike;
pub mod types;

use async_trait::async_trait;

use crate::candidate::Candidate;
use crate::error::Result;

pub use beam::BeamStrategy;
pub use strike::StrikeStrategy;
pub use types::{
    AnalystBriefing, ConstraintMode, GenerationContext, StrategyPolicy, TransformHint,
    WorkerAssignment, WorkerRole,
};

/// Produces candidates for one query. Implementations may fail partially
/// (individual workers error out) without failing the whole call -- an
/// empty `Ok(vec![])` is a valid, non-exceptional result.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Human-readable strategy name, recorded on every candidate it
    /// produces and in the [`crate::manifest::RunManifest`].
    fn name(&self) -> &'static str;

    async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<Vec<Candidate>>;
}
