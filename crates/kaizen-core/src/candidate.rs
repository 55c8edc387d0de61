//! Candidates and their content-addressed identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest; the sole identity across cache, archive,
/// and migration.
pub type Fingerprint = String;

pub type ExampleId = String;

/// How a candidate came into existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Seed,
    RuleEdit,
    Reflection,
    Merge,
    Compression,
    Migrant,
}

/// A unit of optimization. Immutable once constructed; a mutated candidate
/// is a new entity with its own fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    #[serde(default)]
    pub parents: Vec<Fingerprint>,
    pub origin: Origin,
    pub token_estimate: u64,
}

impl Candidate {
    pub fn seed(text: impl Into<String>) -> Self {
        let text = text.into();
        let token_estimate = estimate_tokens(&text);
        Self {
            text,
            parents: Vec::new(),
            origin: Origin::Seed,
            token_estimate,
        }
    }

    pub fn child(text: impl Into<String>, origin: Origin, parents: Vec<Fingerprint>) -> Self {
        let text = text.into();
        let token_estimate = estimate_tokens(&text);
        Self {
            text,
            parents,
            origin,
            token_estimate,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        candidate_fingerprint(&self.text)
    }
}

/// Collapse all whitespace runs to single spaces so that cosmetic edits do
/// not change identity.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn candidate_fingerprint(text: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for one (candidate, example, shard scheme) evaluation.
pub fn eval_key(fingerprint: &str, example_id: &str, shard_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(example_id.as_bytes());
    hasher.update(b"|");
    hasher.update(shard_version.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Cheap token estimate used for budgets and QD descriptors; roughly four
/// characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_under_whitespace() {
        let a = candidate_fingerprint("answer  the\n question");
        let b = candidate_fingerprint("answer the question");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_text() {
        assert_ne!(
            candidate_fingerprint("answer"),
            candidate_fingerprint("reply")
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_text("  a \t b \n c ");
        assert_eq!(normalize_text(&once), once);
    }

    #[test]
    fn eval_key_varies_per_example_and_shard_version() {
        let fp = candidate_fingerprint("answer");
        let base = eval_key(&fp, "ex-1", 0);
        assert_ne!(base, eval_key(&fp, "ex-2", 0));
        assert_ne!(base, eval_key(&fp, "ex-1", 1));
        assert_eq!(base, eval_key(&fp, "ex-1", 0));
    }

    #[test]
    fn seed_candidate_estimates_tokens() {
        let candidate = Candidate::seed("12345678");
        assert_eq!(candidate.token_estimate, 2);
        assert_eq!(candidate.origin, Origin::Seed);
        assert!(candidate.parents.is_empty());
    }
}
