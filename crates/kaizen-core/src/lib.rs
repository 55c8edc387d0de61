//! Core data contracts shared across the kaizen optimizer crates.
//!
//! Everything that crosses a component boundary lives here: candidates and
//! their fingerprints, evaluation results, the oracle and dataset seams,
//! the island configuration surface, and the JSONL event stream.

pub mod candidate;
pub mod config;
pub mod event;
pub mod oracle;
pub mod result;

pub use candidate::{
    candidate_fingerprint, estimate_tokens, eval_key, normalize_text, Candidate, ExampleId,
    Fingerprint, Origin,
};
pub use config::IslandConfig;
pub use event::{EventKind, EventLog, EventRecord, ObjectiveStats};
pub use oracle::{Dataset, ExamplePayload, InMemoryDataset, OracleError, ReflectionOracle, TaskOracle, TaskScore};
pub use result::{
    EvaluationResult, ShardResult, Trace, MAX_FAILURE_TRACES, NEG_COST, QUALITY, TOKENS,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub(crate) fn io_err(err: std::io::Error) -> CoreError {
    CoreError::Io(err.to_string())
}
