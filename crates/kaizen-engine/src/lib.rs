//! The per-island optimizer.
//!
//! One `Orchestrator` per island process drives the round loop: drain
//! migrants, mutate parents drawn from the archive, race the cohort up the
//! shard ladder, fold survivors into the Pareto + quality-diversity
//! archive, and periodically merge, compress, and migrate elites.

pub mod archive;
pub mod compression;
pub mod evaluator;
pub mod governor;
pub mod mutator;
pub mod orchestrator;
pub mod sampler;
pub mod scheduler;

pub use archive::{Archive, ArchiveEntry, InsertOutcome, QdKey};
pub use compression::TokenController;
pub use evaluator::Evaluator;
pub use governor::{compute_hypervolume_2d, EpochMetrics, GovernorConfig, StopDecision, StopGovernor};
pub use mutator::{Mutator, ParentContext};
pub use orchestrator::{Orchestrator, RunBudget, RunReport, StopReason};
pub use sampler::{HardnessSet, ShardSampler};
pub use scheduler::{RaceState, Racer, RoundOutcome, Rung, Scheduler};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("cache error: {0}")]
    Cache(#[from] kaizen_cache::CacheError),
    #[error("migration error: {0}")]
    Migration(#[from] kaizen_migration::MigrationError),
    #[error("event stream error: {0}")]
    Events(#[from] kaizen_core::CoreError),
}

/// Event emission never interrupts optimization; failures surface as
/// warnings only.
pub(crate) fn record_event(log: &kaizen_core::EventLog, round: u64, kind: kaizen_core::EventKind) {
    if let Err(err) = log.emit(round, kind) {
        tracing::warn!(error = %err, "failed to append event record");
    }
}

/// Deterministic seed mixer for per-(island, round, slot) random draws.
pub(crate) fn mix_seed(parts: &[u64]) -> u64 {
    let mut state = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        state ^= part.wrapping_add(0x9e37_79b9_7f4a_7c15);
        state = state.wrapping_mul(0x0000_0100_0000_01b3);
    }
    state
}
