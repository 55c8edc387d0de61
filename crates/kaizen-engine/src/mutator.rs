//! Offspring generation: rule-based edits, reflection, and merges.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kaizen_core::{normalize_text, Candidate, Origin, ReflectionOracle, Trace};

use crate::mix_seed;

/// A parent drawn from the archive (or the seed pool), with the context the
/// operators need: its latest quality and its most recent failure traces.
#[derive(Clone, Debug)]
pub struct ParentContext {
    pub candidate: Candidate,
    pub quality: f64,
    pub traces: Vec<Trace>,
}

const DIRECTIVES: [&str; 4] = [
    "Think step by step.",
    "Answer with only the final result.",
    "Keep the response under three sentences.",
    "Verify the answer before responding.",
];

const FILLER_WORDS: [&str; 8] = [
    "please", "very", "really", "simply", "basically", "actually", "kindly", "just",
];

fn trim_filler(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.split_whitespace()
                .filter(|word| {
                    let bare = word
                        .trim_matches(|c: char| !c.is_alphanumeric())
                        .to_lowercase();
                    !FILLER_WORDS.contains(&bare.as_str())
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bulletize(text: &str) -> String {
    let sentences: Vec<&str> = text
        .split(['.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if sentences.len() < 2 {
        return text.to_string();
    }
    sentences
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn reorder_sections(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.len() < 2 {
        return text.to_string();
    }
    let first = lines.remove(0);
    lines.push(first);
    lines.join("\n")
}

fn insert_header(text: &str) -> String {
    if text.trim_start().starts_with('#') {
        return text.to_string();
    }
    format!("## Instructions\n{text}")
}

fn append_directive(text: &str, index: usize) -> String {
    let directive = DIRECTIVES[index % DIRECTIVES.len()];
    if text.contains(directive) {
        return text.to_string();
    }
    format!("{text}\n{directive}")
}

/// Deterministic local edit for one (slot, round) pair; the operator and
/// directive rotate so repeated rounds explore the whole library.
pub fn apply_rule_edit(text: &str, slot: usize, round: u64) -> String {
    let op = (slot + round as usize) % 5;
    match op {
        0 => trim_filler(text),
        1 => bulletize(text),
        2 => reorder_sections(text),
        3 => insert_header(text),
        _ => append_directive(text, (slot + round as usize) / 5),
    }
}

/// Produces offspring from parents under a per-round budget. Each proposal
/// is tagged with its origin and parent fingerprint; deduplication against
/// the cache and archive happens at admission, not here.
pub struct Mutator {
    reflection: Arc<dyn ReflectionOracle>,
    amortized_rate: f64,
    reflection_batch_size: usize,
    island_id: usize,
}

impl Mutator {
    pub fn new(
        reflection: Arc<dyn ReflectionOracle>,
        amortized_rate: f64,
        reflection_batch_size: usize,
        island_id: usize,
    ) -> Self {
        Self {
            reflection,
            amortized_rate: amortized_rate.clamp(0.0, 1.0),
            reflection_batch_size: reflection_batch_size.max(1),
            island_id,
        }
    }

    pub async fn propose(
        &self,
        parents: &[ParentContext],
        budget: usize,
        round: u64,
    ) -> Vec<Candidate> {
        let mut offspring: Vec<Candidate> = Vec::new();
        if parents.is_empty() || budget == 0 {
            return offspring;
        }
        let max_slots = budget.saturating_mul(2).max(parents.len());
        for slot in 0..max_slots {
            if offspring.len() >= budget {
                break;
            }
            let parent = &parents[slot % parents.len()];
            let parent_fingerprint = parent.candidate.fingerprint();
            let seed = mix_seed(&[
                self.island_id as u64,
                round,
                slot as u64,
                u64::from_be_bytes(
                    parent_fingerprint.as_bytes()[..8].try_into().unwrap_or([0; 8]),
                ),
            ]);
            let mut rng = StdRng::seed_from_u64(seed);
            if rng.gen::<f64>() < self.amortized_rate {
                let text = apply_rule_edit(&parent.candidate.text, slot, round);
                if normalize_text(&text) == normalize_text(&parent.candidate.text) {
                    continue;
                }
                offspring.push(Candidate::child(
                    text,
                    Origin::RuleEdit,
                    vec![parent_fingerprint],
                ));
            } else {
                if parent.traces.is_empty() {
                    continue;
                }
                let batch = &parent.traces[..parent.traces.len().min(self.reflection_batch_size)];
                let texts = self.reflection.reflect(&parent.candidate.text, batch).await;
                for text in texts {
                    if offspring.len() >= budget {
                        break;
                    }
                    offspring.push(Candidate::child(
                        text,
                        Origin::Reflection,
                        vec![parent_fingerprint.clone()],
                    ));
                }
            }
        }
        offspring
    }

    /// Merge two Pareto elites into a single candidate: the left parent's
    /// lines followed by the right parent's unseen lines. Acceptance is the
    /// orchestrator's call, based on the merged candidate's top-shard
    /// quality.
    pub fn merge(&self, left: &Candidate, right: &Candidate) -> Candidate {
        let mut lines: Vec<&str> = left.text.lines().collect();
        for line in right.text.lines() {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
        Candidate::child(
            lines.join("\n"),
            Origin::Merge,
            vec![left.fingerprint(), right.fingerprint()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    struct EchoReflection;

    #[async_trait]
    impl ReflectionOracle for EchoReflection {
        async fn reflect(&self, parent_text: &str, traces: &[Trace]) -> Vec<String> {
            traces
                .iter()
                .map(|trace| format!("{parent_text} considering {}", trace.example_id))
                .collect()
        }
    }

    struct SilentReflection;

    #[async_trait]
    impl ReflectionOracle for SilentReflection {
        async fn reflect(&self, _parent_text: &str, _traces: &[Trace]) -> Vec<String> {
            Vec::new()
        }
    }

    fn parent(text: &str, traces: usize) -> ParentContext {
        ParentContext {
            candidate: Candidate::seed(text),
            quality: 0.5,
            traces: (0..traces)
                .map(|i| Trace::new(format!("ex-{i}"), "wrong answer", 64))
                .collect(),
        }
    }

    fn mutator(rate: f64) -> Mutator {
        Mutator::new(Arc::new(EchoReflection), rate, 6, 0)
    }

    #[tokio::test]
    async fn rule_edits_respect_the_budget_and_tag_parents() {
        let mutator = mutator(1.0);
        let parents = vec![parent("answer the question. show work.", 0)];
        let offspring = mutator.propose(&parents, 5, 1).await;
        assert!(!offspring.is_empty());
        assert!(offspring.len() <= 5);
        for child in &offspring {
            assert_eq!(child.origin, Origin::RuleEdit);
            assert_eq!(child.parents, vec![parents[0].candidate.fingerprint()]);
            assert_ne!(
                normalize_text(&child.text),
                normalize_text(&parents[0].candidate.text)
            );
        }
    }

    #[tokio::test]
    async fn proposals_are_deterministic_per_round() {
        let mutator = mutator(1.0);
        let parents = vec![parent("solve the problem carefully", 0)];
        let first = mutator.propose(&parents, 8, 3).await;
        let second = mutator.propose(&parents, 8, 3).await;
        let texts = |batch: &[Candidate]| batch.iter().map(|c| c.text.clone()).collect::<Vec<_>>();
        assert_eq!(texts(&first), texts(&second));
        assert_ne!(texts(&first), texts(&mutator.propose(&parents, 8, 4).await));
    }

    #[tokio::test]
    async fn directive_edit_reaches_step_by_step_within_a_few_rounds() {
        let mutator = mutator(1.0);
        let parents = vec![parent("answer", 0)];
        let mut found = false;
        for round in 1..=3 {
            let offspring = mutator.propose(&parents, 16, round).await;
            if offspring.iter().any(|c| c.text.contains("step by step")) {
                found = true;
                break;
            }
        }
        assert!(found, "directive library never proposed a step-by-step edit");
    }

    #[tokio::test]
    async fn reflection_batches_traces_through_the_oracle() {
        let mutator = Mutator::new(Arc::new(EchoReflection), 0.0, 2, 0);
        let parents = vec![parent("base prompt", 4)];
        let offspring = mutator.propose(&parents, 3, 1).await;
        assert!(!offspring.is_empty());
        for child in &offspring {
            assert_eq!(child.origin, Origin::Reflection);
            assert!(child.text.starts_with("base prompt considering"));
        }
    }

    #[tokio::test]
    async fn empty_reflection_output_is_tolerated() {
        let mutator = Mutator::new(Arc::new(SilentReflection), 0.0, 6, 0);
        let parents = vec![parent("base prompt", 4)];
        let offspring = mutator.propose(&parents, 4, 1).await;
        assert!(offspring.is_empty());
    }

    #[test]
    fn merge_keeps_left_order_and_deduplicates_lines() {
        let mutator = mutator(1.0);
        let left = Candidate::seed("shared line\nleft only");
        let right = Candidate::seed("shared line\nright only");
        let merged = mutator.merge(&left, &right);
        assert_eq!(merged.text, "shared line\nleft only\nright only");
        assert_eq!(merged.origin, Origin::Merge);
        assert_eq!(merged.parents.len(), 2);
    }

    #[test]
    fn rule_edit_library_is_deterministic_and_local() {
        let text = "please answer very carefully. explain the result.";
        assert_eq!(apply_rule_edit(text, 0, 0), trim_filler(text));
        assert!(!apply_rule_edit(text, 0, 0).contains("please"));
        assert!(apply_rule_edit(text, 1, 0).starts_with("- "));
        assert!(apply_rule_edit(text, 3, 0).starts_with("## Instructions"));
        let appended = apply_rule_edit(text, 4, 0);
        assert!(appended.ends_with(DIRECTIVES[0]));
    }
}
