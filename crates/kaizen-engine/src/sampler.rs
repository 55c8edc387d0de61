//! Deterministic shard composition with hardness biasing.

use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use kaizen_core::{Dataset, ExampleId, IslandConfig};

use crate::mix_seed;

/// Bounded multiset of example ids that have produced failures. Entries
/// beyond the cap are admitted by reservoir sampling so long-running
/// islands keep a representative sample.
pub struct HardnessSet {
    ids: Vec<ExampleId>,
    cap: usize,
    observed: u64,
    rng: StdRng,
}

impl HardnessSet {
    pub fn new(cap: usize, seed: u64) -> Self {
        Self {
            ids: Vec::new(),
            cap: cap.max(1),
            observed: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn record(&mut self, id: ExampleId) {
        self.observed += 1;
        if self.ids.len() < self.cap {
            self.ids.push(id);
            return;
        }
        let slot = self.rng.gen_range(0..self.observed);
        if (slot as usize) < self.cap {
            self.ids[slot as usize] = id;
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Occurrence counts, deterministically ordered.
    pub fn counts(&self) -> BTreeMap<ExampleId, usize> {
        let mut counts = BTreeMap::new();
        for id in &self.ids {
            *counts.entry(id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Produces the example-id list for each (rung, round). Selection blends a
/// stable coreset, a seeded uniform draw, and the hardness set; the same
/// (island, round, rung) always yields the same shard.
pub struct ShardSampler {
    ids: Vec<ExampleId>,
    island_id: usize,
    coreset_ratio: f64,
    hardness_ratio: f64,
    hardness: HardnessSet,
}

impl ShardSampler {
    pub fn new(dataset: &dyn Dataset, config: &IslandConfig) -> Self {
        let total = (config.coreset_ratio + config.random_ratio + config.hardness_ratio).max(1e-9);
        Self {
            ids: dataset.ids(),
            island_id: config.island_id,
            coreset_ratio: config.coreset_ratio / total,
            hardness_ratio: config.hardness_ratio / total,
            hardness: HardnessSet::new(
                config.hardness_cap,
                mix_seed(&[config.island_id as u64, 0x48]),
            ),
        }
    }

    pub fn dataset_len(&self) -> usize {
        self.ids.len()
    }

    pub fn hardness_len(&self) -> usize {
        self.hardness.len()
    }

    pub fn record_failures(&mut self, ids: &[ExampleId]) {
        for id in ids {
            self.hardness.record(id.clone());
        }
    }

    /// Deterministic shard for one (fraction, round, rung).
    pub fn shard_ids(&self, fraction: f64, round: u64, rung: usize) -> Vec<ExampleId> {
        let total = self.ids.len();
        if total == 0 {
            return Vec::new();
        }
        let n = ((fraction * total as f64).ceil() as usize).clamp(1, total);
        let mut chosen = Vec::with_capacity(n);
        let mut taken: HashSet<usize> = HashSet::with_capacity(n);

        // Stable coreset: an even stride over the dataset order.
        let coreset_n = ((n as f64) * self.coreset_ratio).round() as usize;
        for i in 0..coreset_n {
            let index = i * total / coreset_n.max(1);
            if taken.insert(index) {
                chosen.push(self.ids[index].clone());
            }
        }

        // Hardness bias: most frequently failing ids first.
        let hardness_n = ((n as f64) * self.hardness_ratio).round() as usize;
        if hardness_n > 0 && !self.hardness.is_empty() {
            let counts = self.hardness.counts();
            let mut ranked: Vec<(&ExampleId, &usize)> = counts.iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let mut picked = 0usize;
            for (id, _) in ranked {
                if picked >= hardness_n || chosen.len() >= n {
                    break;
                }
                if let Some(index) = self.ids.iter().position(|known| known == id) {
                    if taken.insert(index) {
                        chosen.push(self.ids[index].clone());
                        picked += 1;
                    }
                }
            }
        }

        // Seeded uniform fill for the remainder.
        let mut rng = StdRng::seed_from_u64(mix_seed(&[
            self.island_id as u64,
            round,
            rung as u64,
        ]));
        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut rng);
        for index in order {
            if chosen.len() >= n {
                break;
            }
            if taken.insert(index) {
                chosen.push(self.ids[index].clone());
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaizen_core::InMemoryDataset;

    fn dataset(n: usize) -> InMemoryDataset {
        InMemoryDataset::new(
            (0..n)
                .map(|i| (format!("ex-{i:03}"), serde_json::json!({ "i": i })))
                .collect(),
        )
    }

    fn sampler(n: usize) -> ShardSampler {
        ShardSampler::new(&dataset(n), &IslandConfig::default())
    }

    #[test]
    fn shards_are_deterministic_per_round_and_rung() {
        let sampler = sampler(40);
        let a = sampler.shard_ids(0.2, 3, 1);
        let b = sampler.shard_ids(0.2, 3, 1);
        assert_eq!(a, b);
        assert_ne!(a, sampler.shard_ids(0.2, 4, 1));
        assert_ne!(a, sampler.shard_ids(0.2, 3, 2));
    }

    #[test]
    fn shard_size_follows_fraction_without_duplicates() {
        let sampler = sampler(40);
        let shard = sampler.shard_ids(0.2, 1, 0);
        assert_eq!(shard.len(), 8);
        let unique: HashSet<_> = shard.iter().collect();
        assert_eq!(unique.len(), shard.len());
        assert_eq!(sampler.shard_ids(1.0, 1, 2).len(), 40);
        assert_eq!(sampler.shard_ids(0.001, 1, 0).len(), 1);
    }

    #[test]
    fn recorded_failures_bias_future_shards() {
        let mut sampler = sampler(40);
        for _ in 0..6 {
            sampler.record_failures(&["ex-037".to_string()]);
        }
        let shard = sampler.shard_ids(0.2, 9, 0);
        assert!(shard.contains(&"ex-037".to_string()));
    }

    #[test]
    fn hardness_reservoir_respects_cap() {
        let mut set = HardnessSet::new(8, 7);
        for i in 0..100 {
            set.record(format!("ex-{i}"));
        }
        assert_eq!(set.len(), 8);
    }

    #[test]
    fn empty_dataset_yields_empty_shard() {
        let sampler = sampler(0);
        assert!(sampler.shard_ids(1.0, 1, 0).is_empty());
    }
}
