//! Island configuration surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// All recognized options for one island. Defaults match the documented
/// configuration surface; everything is serializable so a run can record
/// the exact configuration it used.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IslandConfig {
    pub island_id: usize,
    pub n_islands: usize,
    /// Cap on in-flight task-oracle calls. Cache hits do not count.
    pub eval_concurrency: usize,
    /// Rung fractions of the dataset, strictly increasing.
    pub shards: Vec<f64>,
    /// Minimum absolute uplift over the parent's mean required to promote.
    pub eps_improve: f64,
    /// Fraction of a cohort pruned at each rung.
    pub cohort_quantile: f64,
    pub qd_bins_length: usize,
    pub qd_bins_bullets: usize,
    /// Fixed feature-flag set; presence of each marker in the text forms
    /// the QD grid's subset dimension.
    pub qd_flags: Vec<String>,
    /// Probability that a mutation slot uses a rule edit instead of
    /// reflection.
    pub amortized_rate: f64,
    pub reflection_batch_size: usize,
    pub max_mutations_per_round: usize,
    pub merge_period: u64,
    pub merge_uplift_min: f64,
    pub max_tokens: u64,
    /// Tolerated promotion-objective drop for an accepted compression.
    pub prune_delta: f64,
    pub compression_shard_fraction: f64,
    pub migration_period: u64,
    pub migration_k: usize,
    pub cache_path: PathBuf,
    pub log_path: PathBuf,
    pub migration_root: PathBuf,
    pub log_summary_interval: u64,
    /// Cohort size limit per rung per round; excess racers are held over.
    pub batch_size: usize,
    pub queue_limit: usize,
    pub promote_objective: String,
    pub compression_objective: String,
    /// Quality below this marks an example as failed for hardness and
    /// reflection purposes.
    pub failure_threshold: f64,
    pub max_retries: u32,
    pub eval_timeout_ms: Option<u64>,
    /// Versions the shard-selection scheme inside evaluation cache keys.
    pub shard_version: u32,
    pub hardness_cap: usize,
    pub coreset_ratio: f64,
    pub random_ratio: f64,
    pub hardness_ratio: f64,
    pub auto_stop: bool,
    pub trace_cap: usize,
}

impl Default for IslandConfig {
    fn default() -> Self {
        Self {
            island_id: 0,
            n_islands: 4,
            eval_concurrency: 64,
            shards: vec![0.05, 0.2, 1.0],
            eps_improve: 0.01,
            cohort_quantile: 0.6,
            qd_bins_length: 8,
            qd_bins_bullets: 6,
            qd_flags: vec![
                "step by step".to_string(),
                "example".to_string(),
                "json".to_string(),
            ],
            amortized_rate: 0.8,
            reflection_batch_size: 6,
            max_mutations_per_round: 16,
            merge_period: 3,
            merge_uplift_min: 0.01,
            max_tokens: 2048,
            prune_delta: 0.005,
            compression_shard_fraction: 0.2,
            migration_period: 2,
            migration_k: 3,
            cache_path: PathBuf::from(".kaizen").join("cache"),
            log_path: PathBuf::from(".kaizen").join("logs"),
            migration_root: PathBuf::from(".kaizen").join("migration"),
            log_summary_interval: 10,
            batch_size: 8,
            queue_limit: 128,
            promote_objective: "quality".to_string(),
            compression_objective: "quality".to_string(),
            failure_threshold: 0.5,
            max_retries: 2,
            eval_timeout_ms: None,
            shard_version: 0,
            hardness_cap: 256,
            coreset_ratio: 0.5,
            random_ratio: 0.3,
            hardness_ratio: 0.2,
            auto_stop: false,
            trace_cap: 2048,
        }
    }
}

impl IslandConfig {
    pub fn with_island(mut self, island_id: usize, n_islands: usize) -> Self {
        self.island_id = island_id;
        self.n_islands = n_islands.max(1);
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.cache_path = root.join("cache");
        self.log_path = root.join("logs");
        self.migration_root = root.join("migration");
        self
    }

    pub fn with_shards(mut self, shards: Vec<f64>) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_eval_concurrency(mut self, eval_concurrency: usize) -> Self {
        self.eval_concurrency = eval_concurrency.max(1);
        self
    }

    pub fn with_amortized_rate(mut self, amortized_rate: f64) -> Self {
        self.amortized_rate = amortized_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_auto_stop(mut self, auto_stop: bool) -> Self {
        self.auto_stop = auto_stop;
        self
    }

    pub fn with_max_mutations_per_round(mut self, budget: usize) -> Self {
        self.max_mutations_per_round = budget;
        self
    }
}
