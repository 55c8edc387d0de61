//! External collaborator seams: task oracle, reflection oracle, dataset.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candidate::ExampleId;
use crate::result::Trace;

/// Payloads are opaque to the core; they pass straight through to the
/// task oracle.
pub type ExamplePayload = serde_json::Value;

/// Error channel of the task oracle. Transient failures are retried by the
/// evaluator; permanent ones become structural failures.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transient oracle failure: {0}")]
    Transient(String),
    #[error("permanent oracle failure: {0}")]
    Permanent(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transient(_))
    }
}

/// Raw scores returned by the task oracle for one (candidate, example) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskScore {
    pub quality: f64,
    pub neg_cost: f64,
    pub tokens: f64,
    #[serde(default)]
    pub trace: Option<String>,
}

#[async_trait]
pub trait TaskOracle: Send + Sync {
    async fn score(
        &self,
        candidate_text: &str,
        example: &ExamplePayload,
    ) -> Result<TaskScore, OracleError>;
}

/// Reflection over failure traces. May return nothing; must not fail for
/// input it cannot handle.
#[async_trait]
pub trait ReflectionOracle: Send + Sync {
    async fn reflect(&self, parent_text: &str, traces: &[Trace]) -> Vec<String>;
}

/// Finite, stably ordered enumeration of evaluation examples.
pub trait Dataset: Send + Sync {
    fn ids(&self) -> Vec<ExampleId>;
    fn payload(&self, id: &str) -> Option<ExamplePayload>;

    fn len(&self) -> usize {
        self.ids().len()
    }

    fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }
}

/// Dataset held fully in memory; the common case for benchmarks and tests.
pub struct InMemoryDataset {
    entries: Vec<(ExampleId, ExamplePayload)>,
}

impl InMemoryDataset {
    pub fn new(entries: Vec<(ExampleId, ExamplePayload)>) -> Self {
        Self { entries }
    }

    pub fn from_payloads(payloads: impl IntoIterator<Item = ExamplePayload>) -> Self {
        let entries = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| (format!("ex-{index:04}"), payload))
            .collect();
        Self { entries }
    }
}

impl Dataset for InMemoryDataset {
    fn ids(&self) -> Vec<ExampleId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    fn payload(&self, id: &str) -> Option<ExamplePayload> {
        self.entries
            .iter()
            .find(|(entry_id, _)| entry_id == id)
            .map(|(_, payload)| payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_dataset_keeps_stable_order() {
        let dataset = InMemoryDataset::from_payloads(vec![
            serde_json::json!({"q": 1}),
            serde_json::json!({"q": 2}),
        ]);
        assert_eq!(dataset.ids(), dataset.ids());
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.payload("ex-0001"), Some(serde_json::json!({"q": 2})));
        assert_eq!(dataset.payload("missing"), None);
    }

    #[test]
    fn oracle_error_kinds() {
        assert!(OracleError::Transient("x".into()).is_transient());
        assert!(!OracleError::Permanent("x".into()).is_transient());
    }
}
