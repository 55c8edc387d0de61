//! Evaluation results and their shard-level aggregates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::candidate::ExampleId;

pub const QUALITY: &str = "quality";
pub const NEG_COST: &str = "neg_cost";
pub const TOKENS: &str = "tokens";

/// Cap on failure traces retained per shard.
pub const MAX_FAILURE_TRACES: usize = 32;

/// Opaque payload handed from the task oracle to the reflection oracle.
/// The core never inspects it beyond enforcing the size cap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub example_id: ExampleId,
    pub payload: String,
}

impl Trace {
    pub fn new(example_id: impl Into<ExampleId>, payload: impl Into<String>, cap: usize) -> Self {
        let mut payload = payload.into();
        if payload.chars().count() > cap {
            payload = payload.chars().take(cap).collect();
        }
        Self {
            example_id: example_id.into(),
            payload,
        }
    }
}

/// Outcome of scoring one (candidate, example) pair.
///
/// `failure` marks a quality score below the configured threshold; that is
/// data, not an error, and it feeds the hardness set and reflection.
/// `structural` marks an infrastructure failure (exhausted retries,
/// permanent oracle error) and prunes the candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub example_id: ExampleId,
    pub objectives: BTreeMap<String, f64>,
    #[serde(default)]
    pub trace: Option<Trace>,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub structural: bool,
}

impl EvaluationResult {
    pub fn new(
        example_id: impl Into<ExampleId>,
        objectives: BTreeMap<String, f64>,
        trace: Option<Trace>,
        failure_threshold: f64,
    ) -> Self {
        let failure = objectives.get(QUALITY).copied().unwrap_or(0.0) < failure_threshold;
        Self {
            example_id: example_id.into(),
            objectives,
            trace,
            failure,
            structural: false,
        }
    }

    /// Result recorded when the oracle could not produce a score at all.
    pub fn structural_failure(
        example_id: impl Into<ExampleId>,
        reason: impl Into<String>,
        trace_cap: usize,
    ) -> Self {
        let example_id = example_id.into();
        let mut objectives = BTreeMap::new();
        objectives.insert(QUALITY.to_string(), 0.0);
        objectives.insert(NEG_COST.to_string(), 0.0);
        objectives.insert(TOKENS.to_string(), 0.0);
        let trace = Trace::new(example_id.clone(), reason, trace_cap);
        Self {
            example_id,
            objectives,
            trace: Some(trace),
            failure: true,
            structural: true,
        }
    }

    pub fn objective(&self, key: &str) -> f64 {
        self.objectives.get(key).copied().unwrap_or(0.0)
    }

    /// Equality check used by the cache write-once rule. Traces are part of
    /// the stored value and participate in the comparison.
    pub fn value_equal(&self, other: &EvaluationResult) -> bool {
        self == other
    }
}

/// Aggregate of evaluation results for one candidate across one shard.
/// Written once when the shard completes; never mutated.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub means: BTreeMap<String, f64>,
    pub count: usize,
    pub failure_traces: Vec<Trace>,
    pub failure_ids: Vec<ExampleId>,
    pub structural_failures: usize,
    pub duration_ms: u64,
}

impl ShardResult {
    /// Exact per-objective means over every produced result. Aggregation has
    /// no positional dependence.
    pub fn aggregate(results: &[EvaluationResult], duration_ms: u64) -> Self {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        let mut failure_traces = Vec::new();
        let mut failure_ids = Vec::new();
        let mut structural_failures = 0usize;
        for result in results {
            for (key, value) in &result.objectives {
                *totals.entry(key.clone()).or_insert(0.0) += value;
            }
            if result.structural {
                structural_failures += 1;
            }
            if result.failure {
                failure_ids.push(result.example_id.clone());
                if failure_traces.len() < MAX_FAILURE_TRACES {
                    if let Some(trace) = &result.trace {
                        failure_traces.push(trace.clone());
                    }
                }
            }
        }
        let count = results.len();
        let means = totals
            .into_iter()
            .map(|(key, total)| (key, total / count.max(1) as f64))
            .collect();
        Self {
            means,
            count,
            failure_traces,
            failure_ids,
            structural_failures,
            duration_ms,
        }
    }

    pub fn objective(&self, key: &str) -> f64 {
        self.means.get(key).copied().unwrap_or(0.0)
    }

    pub fn is_structural_failure(&self) -> bool {
        self.structural_failures > 0
    }
}
