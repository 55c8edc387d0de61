//! The per-island round loop.
//!
//! Round sequence: drain migrants, draw parents, mutate, race the cohort,
//! archive the finishers, then periodically merge, compress, migrate, and
//! summarize. Archive and scheduler state is mutated only from this flow,
//! so their updates are linearizable within the island.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kaizen_cache::DiskCache;
use kaizen_core::{
    candidate_fingerprint, Candidate, Dataset, EventKind, EventLog, Fingerprint, IslandConfig,
    ObjectiveStats, Origin, ReflectionOracle, ShardResult, TaskOracle, Trace, NEG_COST, QUALITY,
};
use kaizen_migration::{Migrant, MigrantEnvelope, RingChannel};

use crate::archive::{Archive, ArchiveEntry};
use crate::compression::TokenController;
use crate::evaluator::Evaluator;
use crate::governor::{EpochMetrics, GovernorConfig, StopGovernor};
use crate::mutator::{Mutator, ParentContext};
use crate::record_event;
use crate::sampler::ShardSampler;
use crate::scheduler::Scheduler;
use crate::EngineError;

/// Parents drawn from the top of the frontier each round.
const PARETO_PARENTS: usize = 4;
/// Parents sampled from the QD grid each round.
const QD_PARENTS: usize = 4;

#[derive(Clone, Copy, Debug, Default)]
pub struct RunBudget {
    pub max_rounds: Option<u64>,
    pub max_evaluations: Option<u64>,
}

impl RunBudget {
    pub fn rounds(max_rounds: u64) -> Self {
        Self {
            max_rounds: Some(max_rounds),
            max_evaluations: None,
        }
    }

    pub fn with_max_evaluations(mut self, max_evaluations: u64) -> Self {
        self.max_evaluations = Some(max_evaluations);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RoundsExhausted,
    EvaluationsExhausted,
    EmptyDataset,
    Converged,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub rounds: u64,
    pub evaluations: u64,
    pub reason: StopReason,
    pub pareto: Vec<Candidate>,
    pub pareto_entries: Vec<ArchiveEntry>,
    pub qd_filled: usize,
    pub cache_hit_rate: f64,
}

#[derive(Serialize, Deserialize)]
struct QueuedRacer {
    candidate: Candidate,
    parent_quality: Option<f64>,
}

/// Round counter, archive contents, and pending racers; enough to resume
/// an interrupted island.
#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    round: u64,
    evaluations: u64,
    entries: Vec<ArchiveEntry>,
    queue: Vec<QueuedRacer>,
}

pub struct Orchestrator {
    config: IslandConfig,
    dataset: Arc<dyn Dataset>,
    cache: Arc<DiskCache>,
    evaluator: Evaluator,
    scheduler: Scheduler,
    sampler: ShardSampler,
    archive: Archive,
    mutator: Mutator,
    controller: TokenController,
    channel: RingChannel,
    events: EventLog,
    governor: StopGovernor,
    stop: Arc<AtomicBool>,
    seeds: Vec<Candidate>,
    round: u64,
    last_round_evaluations: u64,
    known_quality: HashMap<Fingerprint, f64>,
    recent_traces: HashMap<Fingerprint, Vec<Trace>>,
    hop_counts: HashMap<Fingerprint, u32>,
}

impl Orchestrator {
    pub fn new(
        config: IslandConfig,
        oracle: Arc<dyn TaskOracle>,
        reflection: Arc<dyn ReflectionOracle>,
        dataset: Arc<dyn Dataset>,
    ) -> Result<Self, EngineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(DiskCache::new(&config.cache_path));
        let evaluator = Evaluator::new(
            oracle,
            dataset.clone(),
            cache.clone(),
            &config,
            stop.clone(),
        );
        let scheduler = Scheduler::new(&config)?;
        let sampler = ShardSampler::new(dataset.as_ref(), &config);
        let archive = Archive::new(&config);
        let mutator = Mutator::new(
            reflection,
            config.amortized_rate,
            config.reflection_batch_size,
            config.island_id,
        );
        let controller = TokenController::new(&config);
        let channel = RingChannel::new(
            &config.migration_root,
            config.island_id,
            config.n_islands,
            config.queue_limit,
        );
        let events = EventLog::new(&config.log_path, config.island_id);
        Ok(Self {
            config,
            dataset,
            cache,
            evaluator,
            scheduler,
            sampler,
            archive,
            mutator,
            controller,
            channel,
            events,
            governor: StopGovernor::new(GovernorConfig::default()),
            stop,
            seeds: Vec::new(),
            round: 0,
            last_round_evaluations: 0,
            known_quality: HashMap::new(),
            recent_traces: HashMap::new(),
            hop_counts: HashMap::new(),
        })
    }

    /// Shared flag for cooperative cancellation from another task or a
    /// signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluator.oracle_calls()
    }

    /// Run the optimization loop until a budget is exhausted, the stop flag
    /// is raised, or (with `auto_stop`) the governor reports convergence.
    pub async fn run(
        &mut self,
        seeds: Vec<Candidate>,
        budget: RunBudget,
    ) -> Result<RunReport, EngineError> {
        if self.dataset.is_empty() {
            self.emit_summary(self.round);
            return Ok(self.report(StopReason::EmptyDataset));
        }
        self.seeds = seeds.clone();
        for seed in seeds {
            if !self.archive.contains(&seed.fingerprint()) {
                self.scheduler.admit(seed, None);
            }
        }

        let reason = loop {
            if self.stop.load(Ordering::Relaxed) {
                break StopReason::Cancelled;
            }
            if let Some(max_rounds) = budget.max_rounds {
                if self.round >= max_rounds {
                    break StopReason::RoundsExhausted;
                }
            }
            if let Some(max_evaluations) = budget.max_evaluations {
                if self.evaluator.oracle_calls() >= max_evaluations {
                    break StopReason::EvaluationsExhausted;
                }
            }
            self.round += 1;
            let round = self.round;
            let qd_before = self.archive.qd_filled();

            self.admit_migrants(round);

            let parents = self.draw_parents(round);
            let offspring = self
                .mutator
                .propose(&parents, self.config.max_mutations_per_round, round)
                .await;
            self.admit_offspring(offspring, round);

            let outcome = self
                .scheduler
                .run_round(&self.evaluator, &self.sampler, round, &self.events)
                .await;
            self.sampler.record_failures(&outcome.failure_ids);

            let mut fresh: Vec<Fingerprint> = Vec::new();
            let mut archived = 0usize;
            for (candidate, shard) in outcome.finished {
                let fingerprint = self.archive_finished(candidate, shard, round)?;
                if let Some(fingerprint) = fingerprint {
                    fresh.push(fingerprint);
                    archived += 1;
                }
            }

            // Merges run before compression when both fire in one round.
            if self.config.merge_period > 0 && round % self.config.merge_period == 0 {
                self.attempt_merge(round, &mut fresh).await?;
            }
            self.compress_elites(round, &fresh).await?;

            if self.config.migration_period > 0 && round % self.config.migration_period == 0 {
                self.emit_migrants(round);
            }
            if self.config.log_summary_interval > 0
                && round % self.config.log_summary_interval == 0
            {
                self.emit_summary(round);
            }

            let converged = self.update_governor(round, qd_before, archived);
            self.save_state();
            if self.config.auto_stop && converged {
                break StopReason::Converged;
            }
        };

        // Cooperative shutdown: per-round awaits have completed, so nothing
        // is in flight; persist and emit a final summary.
        self.emit_summary(self.round);
        self.save_state();
        Ok(self.report(reason))
    }

    fn report(&self, reason: StopReason) -> RunReport {
        RunReport {
            rounds: self.round,
            evaluations: self.evaluator.oracle_calls(),
            reason,
            pareto: self.archive.pareto_candidates(),
            pareto_entries: self.archive.pareto_entries(),
            qd_filled: self.archive.qd_filled(),
            cache_hit_rate: self.cache.warm_rate(),
        }
    }

    fn is_known(&self, fingerprint: &Fingerprint) -> bool {
        self.archive.contains(fingerprint)
            || self.scheduler.is_tracked(fingerprint)
            || self.cache.has_candidate(fingerprint)
    }

    fn draw_parents(&self, round: u64) -> Vec<ParentContext> {
        let mut parents = Vec::new();
        let mut seen = Vec::new();
        for entry in self.archive.pareto_entries().into_iter().take(PARETO_PARENTS) {
            let fingerprint = entry.candidate.fingerprint();
            seen.push(fingerprint.clone());
            parents.push(self.parent_context(entry.candidate, &fingerprint));
        }
        for candidate in self.archive.sample_qd(QD_PARENTS, round) {
            let fingerprint = candidate.fingerprint();
            if seen.contains(&fingerprint) {
                continue;
            }
            seen.push(fingerprint.clone());
            parents.push(self.parent_context(candidate, &fingerprint));
        }
        if parents.is_empty() {
            for seed in &self.seeds {
                let fingerprint = seed.fingerprint();
                parents.push(self.parent_context(seed.clone(), &fingerprint));
            }
        }
        parents
    }

    fn parent_context(&self, candidate: Candidate, fingerprint: &Fingerprint) -> ParentContext {
        ParentContext {
            quality: self.known_quality.get(fingerprint).copied().unwrap_or(0.0),
            traces: self
                .recent_traces
                .get(fingerprint)
                .cloned()
                .unwrap_or_default(),
            candidate,
        }
    }

    fn admit_offspring(&mut self, offspring: Vec<Candidate>, round: u64) {
        let mut batch: Vec<Fingerprint> = Vec::new();
        for child in offspring {
            let fingerprint = child.fingerprint();
            record_event(
                &self.events,
                round,
                EventKind::MutationProposed {
                    fingerprint: fingerprint.clone(),
                    origin: child.origin,
                    parent: child.parents.first().cloned(),
                },
            );
            if child.token_estimate > self.config.max_tokens {
                continue;
            }
            if batch.contains(&fingerprint) || self.is_known(&fingerprint) {
                continue;
            }
            let parent_quality = child
                .parents
                .first()
                .and_then(|parent| self.known_quality.get(parent))
                .copied();
            let origin = child.origin;
            if self.scheduler.admit(child, parent_quality) {
                batch.push(fingerprint.clone());
                record_event(
                    &self.events,
                    round,
                    EventKind::MutationAccepted {
                        fingerprint,
                        origin,
                    },
                );
            }
        }
    }

    /// Insert a fully evaluated candidate and record the bookkeeping every
    /// later stage relies on. Returns the fingerprint when the archive
    /// accepted it into the frontier or the grid.
    fn archive_finished(
        &mut self,
        candidate: Candidate,
        shard: ShardResult,
        round: u64,
    ) -> Result<Option<Fingerprint>, EngineError> {
        let fingerprint = candidate.fingerprint();
        self.known_quality
            .insert(fingerprint.clone(), shard.objective(QUALITY));
        self.recent_traces
            .insert(fingerprint.clone(), shard.failure_traces.clone());
        let origin = candidate.origin;
        let outcome = self.archive.insert(candidate, shard)?;
        if outcome.duplicate {
            return Ok(None);
        }
        record_event(
            &self.events,
            round,
            EventKind::ArchiveUpdate {
                fingerprint: fingerprint.clone(),
                origin,
                pareto_accepted: outcome.pareto_accepted,
                qd_accepted: outcome.qd_accepted,
            },
        );
        if let Err(err) = self.cache.record_candidate(&fingerprint) {
            tracing::warn!(error = %err, "failed to record candidate marker");
        }
        if outcome.pareto_accepted || outcome.qd_accepted {
            return Ok(Some(fingerprint));
        }
        Ok(None)
    }

    fn admit_migrants(&mut self, round: u64) {
        let envelopes = match self.channel.drain() {
            Ok(envelopes) => envelopes,
            Err(err) => {
                tracing::warn!(error = %err, "inbox drain failed");
                return;
            }
        };
        let mut count = 0usize;
        let mut admitted = 0usize;
        for envelope in envelopes {
            for migrant in envelope.migrants {
                count += 1;
                let fingerprint = candidate_fingerprint(&migrant.text);
                if fingerprint != migrant.fingerprint {
                    tracing::warn!(
                        claimed = %migrant.fingerprint,
                        "migrant fingerprint mismatch, discarded"
                    );
                    continue;
                }
                self.hop_counts
                    .insert(fingerprint.clone(), migrant.hop_count + 1);
                if self.is_known(&fingerprint) {
                    continue;
                }
                // Migrants re-race from rung zero; their claimed objective
                // snapshot is observability only.
                let candidate = Candidate::child(migrant.text, Origin::Migrant, Vec::new());
                if self.scheduler.admit(candidate, None) {
                    admitted += 1;
                }
            }
        }
        if count > 0 {
            record_event(&self.events, round, EventKind::MigrateIn { count, admitted });
        }
    }

    fn emit_migrants(&mut self, round: u64) {
        let elites = self.archive.pareto_entries();
        if elites.is_empty() {
            return;
        }
        let migrants: Vec<Migrant> = elites
            .iter()
            .take(self.config.migration_k)
            .map(|entry| {
                let fingerprint = entry.candidate.fingerprint();
                Migrant {
                    text: entry.candidate.text.clone(),
                    objectives: entry.result.means.clone(),
                    hop_count: self.hop_counts.get(&fingerprint).copied().unwrap_or(0),
                    fingerprint,
                }
            })
            .collect();
        let count = migrants.len();
        let envelope = MigrantEnvelope::new(self.config.island_id, migrants);
        match self.channel.send(&envelope) {
            Ok(outcome) => record_event(
                &self.events,
                round,
                EventKind::MigrateOut {
                    to_island: outcome.to_island,
                    count,
                    dropped: outcome.dropped,
                },
            ),
            Err(err) => tracing::warn!(error = %err, "outbox send failed"),
        }
    }

    async fn attempt_merge(
        &mut self,
        round: u64,
        fresh: &mut Vec<Fingerprint>,
    ) -> Result<(), EngineError> {
        let elites = self.archive.pareto_entries();
        if elites.len() < 2 {
            return Ok(());
        }
        let left = &elites[0];
        let right = &elites[1];
        let child = self.mutator.merge(&left.candidate, &right.candidate);
        let child_fingerprint = child.fingerprint();
        record_event(
            &self.events,
            round,
            EventKind::MergeProposed {
                left: left.candidate.fingerprint(),
                right: right.candidate.fingerprint(),
                child: child_fingerprint.clone(),
            },
        );
        if self.is_known(&child_fingerprint) {
            return Ok(());
        }
        let top = self.scheduler.top_rung();
        let ids = self
            .sampler
            .shard_ids(self.scheduler.rung_fraction(top), round, top);
        let shard = self.evaluator.evaluate(&child, &ids, None).await;
        let better_parent = left
            .result
            .objective(QUALITY)
            .max(right.result.objective(QUALITY));
        let uplift = shard.objective(QUALITY) - better_parent;
        if shard.is_structural_failure() || uplift < self.config.merge_uplift_min {
            record_event(
                &self.events,
                round,
                EventKind::MergeRejected {
                    child: child_fingerprint,
                    uplift,
                },
            );
            return Ok(());
        }
        if let Some(fingerprint) = self.archive_finished(child, shard, round)? {
            fresh.push(fingerprint);
        }
        record_event(
            &self.events,
            round,
            EventKind::MergeAccepted {
                child: child_fingerprint,
                uplift,
            },
        );
        Ok(())
    }

    async fn compress_elites(
        &mut self,
        round: u64,
        fresh: &[Fingerprint],
    ) -> Result<(), EngineError> {
        for fingerprint in fresh {
            let Some(entry) = self.archive.entry(fingerprint) else {
                continue;
            };
            if entry.candidate.origin == Origin::Compression {
                continue;
            }
            let original = entry.candidate.clone();
            let Some(proposal) = self.controller.propose(&original) else {
                continue;
            };
            let compressed_fingerprint = proposal.fingerprint();
            if self.is_known(&compressed_fingerprint) {
                continue;
            }
            // The validation shard has its own rung tag so its composition
            // is stable but distinct from the racing shards.
            let rung_tag = self.scheduler.top_rung() + 1;
            let ids = self
                .sampler
                .shard_ids(self.controller.shard_fraction(), round, rung_tag);
            let original_shard = self.evaluator.evaluate(&original, &ids, None).await;
            let compressed_shard = self.evaluator.evaluate(&proposal, &ids, None).await;
            if compressed_shard.is_structural_failure() {
                continue;
            }
            let objective = self.controller.objective().to_string();
            if !self.controller.accepts(
                original_shard.objective(&objective),
                compressed_shard.objective(&objective),
            ) {
                continue;
            }
            let saved_tokens = original.token_estimate.saturating_sub(proposal.token_estimate);
            self.archive_finished(proposal, compressed_shard, round)?;
            record_event(
                &self.events,
                round,
                EventKind::CompressionApplied {
                    original: fingerprint.clone(),
                    compressed: compressed_fingerprint,
                    saved_tokens,
                },
            );
        }
        Ok(())
    }

    fn emit_summary(&self, round: u64) {
        let mut objectives = BTreeMap::new();
        for key in self.archive.objective_keys() {
            if let Some(stats) = ObjectiveStats::from_samples(&self.archive.objective_samples(&key))
            {
                objectives.insert(key, stats);
            }
        }
        record_event(
            &self.events,
            round,
            EventKind::Summary {
                queue_depth: self.scheduler.pending(),
                pareto_size: self.archive.pareto_entries().len(),
                qd_filled: self.archive.qd_filled(),
                evaluations: self.evaluator.oracle_calls(),
                cache_hit_rate: self.cache.warm_rate(),
                objectives,
                hypervolume: self.archive.hypervolume(),
            },
        );
    }

    fn update_governor(&mut self, round: u64, qd_before: usize, archived: usize) -> bool {
        let evaluations = self.evaluator.oracle_calls();
        let new_evaluations = evaluations.saturating_sub(self.last_round_evaluations);
        self.last_round_evaluations = evaluations;
        let best_quality = self
            .archive
            .objective_samples(QUALITY)
            .into_iter()
            .fold(0.0f64, f64::max);
        let best_cost = self
            .archive
            .objective_samples(NEG_COST)
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max);
        let new_bins = self.archive.qd_filled().saturating_sub(qd_before);
        let qd_novelty_rate = if archived > 0 {
            new_bins as f64 / archived as f64
        } else {
            0.0
        };
        self.governor.update(EpochMetrics {
            round,
            hypervolume: self.archive.hypervolume(),
            new_evaluations,
            best_quality,
            best_cost: if best_cost.is_finite() { best_cost } else { 0.0 },
            frontier: self.archive.frontier_fingerprints(),
            qd_novelty_rate,
            total_tokens_spent: self.evaluator.tokens_spent(),
        });
        self.governor.should_stop().stop
    }

    fn state_path(&self) -> PathBuf {
        self.config
            .cache_path
            .join(format!("island_{}_state.json", self.config.island_id))
    }

    /// Atomic snapshot beside the cache; failures are logged, never fatal.
    fn save_state(&self) {
        let snapshot = StateSnapshot {
            round: self.round,
            evaluations: self.evaluator.oracle_calls(),
            entries: self.archive.entries().cloned().collect(),
            queue: self
                .scheduler
                .queued()
                .into_iter()
                .map(|(candidate, parent_quality)| QueuedRacer {
                    candidate,
                    parent_quality,
                })
                .collect(),
        };
        let path = self.state_path();
        let write = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec_pretty(&snapshot)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if let Err(err) = write {
            tracing::warn!(error = %err, "failed to save island state");
        }
    }

    /// Reload a prior snapshot from the cache directory. Returns whether a
    /// snapshot was applied; a missing or corrupt snapshot starts fresh.
    pub fn restore(&mut self) -> Result<bool, EngineError> {
        let path = self.state_path();
        let Ok(bytes) = fs::read(&path) else {
            return Ok(false);
        };
        let snapshot: StateSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "corrupt state snapshot, starting fresh");
                return Ok(false);
            }
        };
        self.round = snapshot.round;
        for entry in snapshot.entries {
            let fingerprint = entry.candidate.fingerprint();
            self.known_quality
                .insert(fingerprint.clone(), entry.result.objective(QUALITY));
            self.recent_traces
                .insert(fingerprint, entry.result.failure_traces.clone());
            if let Err(err) = self.archive.insert(entry.candidate, entry.result) {
                tracing::warn!(error = %err, "skipping snapshot entry");
            }
        }
        for racer in snapshot.queue {
            self.scheduler.admit(racer.candidate, racer.parent_quality);
        }
        Ok(true)
    }
}
