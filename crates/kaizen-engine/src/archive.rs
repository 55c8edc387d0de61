//! Pareto frontier and quality-diversity grid over fully evaluated
//! candidates.
//!
//! The archive is an arena of entries indexed by fingerprint, with the
//! Pareto and QD indexes maintained on insertion. All mutation happens in
//! `insert`, which completes without suspension so updates are
//! linearizable within an island.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use kaizen_core::{Candidate, Fingerprint, IslandConfig, ShardResult, NEG_COST, QUALITY, TOKENS};

use crate::governor::compute_hypervolume_2d;
use crate::{mix_seed, EngineError};

/// Cell coordinates in the behavioral-descriptor grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QdKey {
    pub length_bin: usize,
    pub bullet_bin: usize,
    pub flags: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub candidate: Candidate,
    pub result: ShardResult,
    pub qd_key: QdKey,
    pub dominated: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InsertOutcome {
    pub pareto_accepted: bool,
    pub qd_accepted: bool,
    /// Set when the fingerprint was already archived; the insert was a
    /// no-op.
    pub duplicate: bool,
}

pub struct Archive {
    entries: BTreeMap<Fingerprint, ArchiveEntry>,
    pareto: BTreeSet<Fingerprint>,
    qd: BTreeMap<QdKey, Fingerprint>,
    promote_objective: String,
    qd_flags: Vec<String>,
    bins_length: usize,
    bins_bullets: usize,
    max_chars: usize,
}

impl Archive {
    pub fn new(config: &IslandConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            pareto: BTreeSet::new(),
            qd: BTreeMap::new(),
            promote_objective: config.promote_objective.clone(),
            qd_flags: config.qd_flags.clone(),
            bins_length: config.qd_bins_length.max(1),
            bins_bullets: config.qd_bins_bullets.max(1),
            max_chars: (config.max_tokens as usize).saturating_mul(4).max(1),
        }
    }

    pub fn qd_key(&self, text: &str) -> QdKey {
        let chars = text.chars().count();
        let length_bin = (chars * self.bins_length / (self.max_chars + 1)).min(self.bins_length - 1);
        let bullets = text
            .lines()
            .filter(|line| {
                let trimmed = line.trim_start();
                trimmed.starts_with("- ")
                    || trimmed.starts_with("* ")
                    || trimmed
                        .split_once('.')
                        .map(|(head, _)| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()))
                        .unwrap_or(false)
            })
            .count();
        let bullet_bin = bullets.min(self.bins_bullets - 1);
        let lowered = text.to_lowercase();
        let mut flags = 0u8;
        for (bit, flag) in self.qd_flags.iter().take(8).enumerate() {
            if lowered.contains(&flag.to_lowercase()) {
                flags |= 1 << bit;
            }
        }
        QdKey {
            length_bin,
            bullet_bin,
            flags,
        }
    }

    fn objective_vector(result: &ShardResult) -> [f64; 3] {
        [
            result.objective(QUALITY),
            result.objective(NEG_COST),
            -result.objective(TOKENS),
        ]
    }

    fn dominates(a: &[f64; 3], b: &[f64; 3]) -> bool {
        let mut strictly = false;
        for (x, y) in a.iter().zip(b.iter()) {
            if x < y {
                return false;
            }
            if x > y {
                strictly = true;
            }
        }
        strictly
    }

    /// Insert a fully evaluated candidate, updating the Pareto frontier and
    /// the QD grid together. Re-inserting an archived fingerprint with the
    /// same text is a no-op; a fingerprint collision with different text is
    /// fatal.
    pub fn insert(
        &mut self,
        candidate: Candidate,
        result: ShardResult,
    ) -> Result<InsertOutcome, EngineError> {
        let fingerprint = candidate.fingerprint();
        if let Some(existing) = self.entries.get(&fingerprint) {
            if existing.candidate.text == candidate.text {
                return Ok(InsertOutcome {
                    duplicate: true,
                    ..InsertOutcome::default()
                });
            }
            return Err(EngineError::Invariant(format!(
                "fingerprint collision with inconsistent text for {fingerprint}"
            )));
        }

        let vector = Self::objective_vector(&result);
        let mut pareto_accepted = true;
        for incumbent in &self.pareto {
            if let Some(entry) = self.entries.get(incumbent) {
                if Self::dominates(&Self::objective_vector(&entry.result), &vector) {
                    pareto_accepted = false;
                    break;
                }
            }
        }
        if pareto_accepted {
            let displaced: Vec<Fingerprint> = self
                .pareto
                .iter()
                .filter(|incumbent| {
                    self.entries
                        .get(*incumbent)
                        .map(|entry| {
                            Self::dominates(&vector, &Self::objective_vector(&entry.result))
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            for loser in displaced {
                self.pareto.remove(&loser);
                if let Some(entry) = self.entries.get_mut(&loser) {
                    entry.dominated = true;
                }
            }
            self.pareto.insert(fingerprint.clone());
        }

        let qd_key = self.qd_key(&candidate.text);
        let score = result.objective(&self.promote_objective);
        let qd_accepted = match self.qd.get(&qd_key) {
            None => {
                self.qd.insert(qd_key, fingerprint.clone());
                true
            }
            Some(incumbent) => {
                let incumbent_score = self
                    .entries
                    .get(incumbent)
                    .map(|entry| entry.result.objective(&self.promote_objective))
                    .unwrap_or(f64::NEG_INFINITY);
                // Strictly better replaces; ties go to the incumbent.
                if score > incumbent_score {
                    self.qd.insert(qd_key, fingerprint.clone());
                    true
                } else {
                    false
                }
            }
        };

        self.entries.insert(
            fingerprint,
            ArchiveEntry {
                candidate,
                result,
                qd_key,
                dominated: !pareto_accepted,
            },
        );
        Ok(InsertOutcome {
            pareto_accepted,
            qd_accepted,
            duplicate: false,
        })
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<&ArchiveEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.values()
    }

    /// Snapshot of the frontier, best promotion objective first.
    pub fn pareto_entries(&self) -> Vec<ArchiveEntry> {
        let mut entries: Vec<ArchiveEntry> = self
            .pareto
            .iter()
            .filter_map(|fingerprint| self.entries.get(fingerprint).cloned())
            .collect();
        entries.sort_by(|a, b| {
            b.result
                .objective(&self.promote_objective)
                .partial_cmp(&a.result.objective(&self.promote_objective))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.candidate.fingerprint().cmp(&b.candidate.fingerprint()))
        });
        entries
    }

    pub fn pareto_candidates(&self) -> Vec<Candidate> {
        self.pareto_entries()
            .into_iter()
            .map(|entry| entry.candidate)
            .collect()
    }

    pub fn frontier_fingerprints(&self) -> BTreeSet<Fingerprint> {
        self.pareto.clone()
    }

    pub fn qd_filled(&self) -> usize {
        self.qd.len()
    }

    pub fn qd_total(&self) -> usize {
        self.bins_length * self.bins_bullets * (1usize << self.qd_flags.len().min(8))
    }

    /// Sample up to k elites from the grid, weighted toward cells whose
    /// flag-subset region is sparsely populated.
    pub fn sample_qd(&self, k: usize, seed: u64) -> Vec<Candidate> {
        let mut region_population: BTreeMap<u8, usize> = BTreeMap::new();
        for key in self.qd.keys() {
            *region_population.entry(key.flags).or_insert(0) += 1;
        }
        let mut pool: Vec<(f64, &Fingerprint)> = self
            .qd
            .iter()
            .map(|(key, fingerprint)| {
                let population = region_population.get(&key.flags).copied().unwrap_or(1);
                (1.0 / population as f64, fingerprint)
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(mix_seed(&[seed, 0x9d]));
        let mut sampled = Vec::new();
        while sampled.len() < k && !pool.is_empty() {
            let total: f64 = pool.iter().map(|(weight, _)| weight).sum();
            let mut draw = rng.gen::<f64>() * total;
            let mut chosen = pool.len() - 1;
            for (index, (weight, _)) in pool.iter().enumerate() {
                draw -= weight;
                if draw <= 0.0 {
                    chosen = index;
                    break;
                }
            }
            let (_, fingerprint) = pool.swap_remove(chosen);
            if let Some(entry) = self.entries.get(fingerprint) {
                sampled.push(entry.candidate.clone());
            }
        }
        sampled
    }

    /// All per-entry means for one objective, for summary statistics.
    pub fn objective_samples(&self, objective: &str) -> Vec<f64> {
        self.entries
            .values()
            .map(|entry| entry.result.objective(objective))
            .collect()
    }

    pub fn objective_keys(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|entry| entry.result.means.keys().cloned())
            .collect()
    }

    /// 2-D hypervolume of the (quality, neg_cost) frontier.
    pub fn hypervolume(&self) -> f64 {
        let points: Vec<(f64, f64)> = self
            .pareto
            .iter()
            .filter_map(|fingerprint| self.entries.get(fingerprint))
            .map(|entry| {
                (
                    entry.result.objective(QUALITY),
                    entry.result.objective(NEG_COST),
                )
            })
            .collect();
        compute_hypervolume_2d(&points, (0.0, -1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    use kaizen_core::Origin;

    fn shard(quality: f64, neg_cost: f64, tokens: f64) -> ShardResult {
        ShardResult {
            means: Map::from([
                (QUALITY.to_string(), quality),
                (NEG_COST.to_string(), neg_cost),
                (TOKENS.to_string(), tokens),
            ]),
            count: 10,
            failure_traces: Vec::new(),
            failure_ids: Vec::new(),
            structural_failures: 0,
            duration_ms: 1,
        }
    }

    fn archive() -> Archive {
        Archive::new(&IslandConfig::default())
    }

    #[test]
    fn pareto_keeps_only_non_dominated_entries() {
        let mut archive = archive();
        archive
            .insert(Candidate::seed("candidate a"), shard(0.8, -1.0, 0.0))
            .unwrap();
        archive
            .insert(Candidate::seed("candidate b"), shard(0.9, -2.0, 0.0))
            .unwrap();
        let outcome = archive
            .insert(Candidate::seed("candidate c"), shard(0.7, -1.0, 0.0))
            .unwrap();
        assert!(!outcome.pareto_accepted);
        let frontier: Vec<f64> = archive
            .pareto_entries()
            .iter()
            .map(|entry| entry.result.objective(QUALITY))
            .collect();
        assert_eq!(frontier, vec![0.9, 0.8]);
        // The dominated entry stays in the arena, flagged.
        assert_eq!(archive.len(), 3);
        let fp = Candidate::seed("candidate c").fingerprint();
        assert!(archive.entry(&fp).unwrap().dominated);
    }

    #[test]
    fn dominated_incumbent_is_displaced_on_insertion() {
        let mut archive = archive();
        archive
            .insert(Candidate::seed("weak entry"), shard(0.5, -2.0, 10.0))
            .unwrap();
        let outcome = archive
            .insert(Candidate::seed("strong entry"), shard(0.9, -1.0, 5.0))
            .unwrap();
        assert!(outcome.pareto_accepted);
        assert_eq!(archive.pareto_candidates().len(), 1);
        assert_eq!(
            archive.pareto_candidates()[0].text,
            "strong entry".to_string()
        );
    }

    #[test]
    fn equal_vectors_coexist_on_the_frontier() {
        let mut archive = archive();
        archive
            .insert(Candidate::seed("first twin"), shard(0.8, -1.0, 7.0))
            .unwrap();
        let outcome = archive
            .insert(Candidate::seed("second twin"), shard(0.8, -1.0, 7.0))
            .unwrap();
        assert!(outcome.pareto_accepted);
        assert_eq!(archive.pareto_candidates().len(), 2);
    }

    #[test]
    fn qd_replacement_is_strictly_better_and_ties_keep_incumbent() {
        let mut archive = archive();
        let incumbent = Candidate::seed("short");
        let challenger = Candidate::seed("brief");
        assert_eq!(archive.qd_key(&incumbent.text), archive.qd_key(&challenger.text));
        archive.insert(incumbent.clone(), shard(0.6, -1.0, 2.0)).unwrap();
        let tied = archive.insert(challenger, shard(0.6, -2.0, 2.0)).unwrap();
        assert!(!tied.qd_accepted);
        let better = archive
            .insert(Candidate::seed("terse"), shard(0.7, -1.0, 2.0))
            .unwrap();
        assert!(better.qd_accepted);
        assert_eq!(archive.qd_filled(), 1);
    }

    #[test]
    fn reinsert_of_same_candidate_is_idempotent() {
        let mut archive = archive();
        let candidate = Candidate::child("compressed text", Origin::Compression, vec![]);
        archive.insert(candidate.clone(), shard(0.8, -1.0, 3.0)).unwrap();
        let repeat = archive.insert(candidate, shard(0.8, -1.0, 3.0)).unwrap();
        assert!(repeat.duplicate);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.pareto_candidates().len(), 1);
    }

    #[test]
    fn qd_key_separates_flags_and_shape() {
        let archive = archive();
        let plain = archive.qd_key("explain the result");
        let stepwise = archive.qd_key("explain the result step by step");
        assert_ne!(plain.flags, stepwise.flags);
        let bullets = archive.qd_key("- one\n- two\n- three");
        assert_eq!(bullets.bullet_bin, 3);
        assert_eq!(archive.qd_key("1. first\n2. second").bullet_bin, 2);
    }

    #[test]
    fn sample_qd_prefers_sparse_flag_regions() {
        let mut archive = archive();
        // Five entries in the no-flag region, one in the step-by-step region.
        for i in 0..5 {
            let text = format!("plain prompt number {i} {}", "x".repeat(i * 1100));
            archive.insert(Candidate::seed(text), shard(0.5, -1.0, 1.0)).unwrap();
        }
        assert_eq!(archive.qd_filled(), 5);
        archive
            .insert(
                Candidate::seed("work step by step through it"),
                shard(0.4, -1.0, 1.0),
            )
            .unwrap();
        let mut rare_hits = 0;
        for seed in 0..40 {
            let sampled = archive.sample_qd(1, seed);
            if sampled[0].text.contains("step by step") {
                rare_hits += 1;
            }
        }
        // The sparse region holds 1/6 of the cells but half the sampling
        // weight, so it must be drawn far more often than uniformly.
        assert!(rare_hits > 6, "rare region drawn {rare_hits}/40 times");
    }

    #[test]
    fn hypervolume_grows_with_frontier_quality() {
        let mut archive = archive();
        archive.insert(Candidate::seed("base"), shard(0.5, -10.0, 1.0)).unwrap();
        let before = archive.hypervolume();
        archive.insert(Candidate::seed("peak"), shard(0.9, -5.0, 1.0)).unwrap();
        assert!(archive.hypervolume() > before);
    }
}
