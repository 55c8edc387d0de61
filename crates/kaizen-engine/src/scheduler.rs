//! Successive-halving race across growing data shards.

use std::collections::{BTreeSet, VecDeque};

use futures::future::join_all;

use kaizen_core::{
    Candidate, EventKind, EventLog, ExampleId, Fingerprint, IslandConfig, ShardResult, NEG_COST,
    QUALITY,
};

use crate::evaluator::Evaluator;
use crate::record_event;
use crate::sampler::ShardSampler;
use crate::EngineError;

/// One shard level of the ladder.
#[derive(Clone, Debug)]
pub struct Rung {
    pub index: usize,
    pub fraction: f64,
    pub promotion_quantile: f64,
    pub eps_improve: f64,
}

pub fn build_rungs(config: &IslandConfig) -> Result<Vec<Rung>, EngineError> {
    if config.shards.is_empty() {
        return Err(EngineError::Config("shards must not be empty".into()));
    }
    let mut previous = 0.0;
    for fraction in &config.shards {
        if *fraction <= previous || *fraction > 1.0 {
            return Err(EngineError::Config(format!(
                "shard fractions must be strictly increasing within (0, 1], got {:?}",
                config.shards
            )));
        }
        previous = *fraction;
    }
    Ok(config
        .shards
        .iter()
        .enumerate()
        .map(|(index, fraction)| Rung {
            index,
            fraction: *fraction,
            promotion_quantile: config.cohort_quantile,
            eps_improve: config.eps_improve,
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaceState {
    Admitted,
    Racing(usize),
    Promoted(usize),
    Pruned(usize),
    FullyEvaluated,
}

#[derive(Clone, Debug)]
pub struct Racer {
    pub candidate: Candidate,
    pub fingerprint: Fingerprint,
    pub parent_quality: Option<f64>,
    pub state: RaceState,
}

#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Candidates that completed the top rung this round, with their
    /// top-shard results.
    pub finished: Vec<(Candidate, ShardResult)>,
    pub pruned: usize,
    pub promotions: usize,
    /// Failing example ids forwarded to the sampler's hardness set.
    pub failure_ids: Vec<ExampleId>,
}

struct PromotionEntry {
    mean: f64,
    quality: f64,
    neg_cost: f64,
    fingerprint: Fingerprint,
    parent_quality: Option<f64>,
}

/// Indices of promoted entries: the top `1 - quantile` fraction of the
/// cohort (never fewer than one), plus anyone beating its parent's mean by
/// `eps`. A cohort of one is decided by the uplift rule alone, with
/// parentless candidates measured against zero.
fn select_promotions(entries: &[PromotionEntry], quantile: f64, eps: f64) -> BTreeSet<usize> {
    let mut promoted = BTreeSet::new();
    let n = entries.len();
    if n == 0 {
        return promoted;
    }
    if n == 1 {
        let base = entries[0].parent_quality.unwrap_or(0.0);
        if entries[0].mean >= base + eps {
            promoted.insert(0);
        }
        return promoted;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let left = &entries[a];
        let right = &entries[b];
        right
            .mean
            .partial_cmp(&left.mean)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                right
                    .quality
                    .partial_cmp(&left.quality)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                right
                    .neg_cost
                    .partial_cmp(&left.neg_cost)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| left.fingerprint.cmp(&right.fingerprint))
    });
    // The cohort top always advances; quantile pruning takes the rest.
    let quantile_count = ((((n as f64) * (1.0 - quantile)).floor() as usize).max(1)).min(n);
    for &index in order.iter().take(quantile_count) {
        promoted.insert(index);
    }
    for (index, entry) in entries.iter().enumerate() {
        if let Some(parent) = entry.parent_quality {
            if entry.mean >= parent + eps {
                promoted.insert(index);
            }
        }
    }
    promoted
}

/// Drives candidates through the rung ladder. A candidate admitted at rung
/// zero either climbs to the top rung and finishes, or is pruned; it never
/// regresses. Cohorts are capped at `batch_size` per rung per round and
/// excess racers are held over.
pub struct Scheduler {
    rungs: Vec<Rung>,
    queues: Vec<VecDeque<Racer>>,
    tracked: BTreeSet<Fingerprint>,
    batch_size: usize,
    promote_objective: String,
}

impl Scheduler {
    pub fn new(config: &IslandConfig) -> Result<Self, EngineError> {
        let rungs = build_rungs(config)?;
        let queues = rungs.iter().map(|_| VecDeque::new()).collect();
        Ok(Self {
            rungs,
            queues,
            tracked: BTreeSet::new(),
            batch_size: config.batch_size.max(1),
            promote_objective: config.promote_objective.clone(),
        })
    }

    pub fn top_rung(&self) -> usize {
        self.rungs.len() - 1
    }

    pub fn rung_fraction(&self, index: usize) -> f64 {
        self.rungs[index].fraction
    }

    /// Admit a candidate at rung zero. Duplicates of a racing fingerprint
    /// are refused.
    pub fn admit(&mut self, candidate: Candidate, parent_quality: Option<f64>) -> bool {
        let fingerprint = candidate.fingerprint();
        if !self.tracked.insert(fingerprint.clone()) {
            return false;
        }
        self.queues[0].push_back(Racer {
            candidate,
            fingerprint,
            parent_quality,
            state: RaceState::Admitted,
        });
        true
    }

    pub fn is_tracked(&self, fingerprint: &Fingerprint) -> bool {
        self.tracked.contains(fingerprint)
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Racers still queued, lowest rung first; used for state snapshots.
    pub fn queued(&self) -> Vec<(Candidate, Option<f64>)> {
        self.queues
            .iter()
            .flat_map(|queue| {
                queue
                    .iter()
                    .map(|racer| (racer.candidate.clone(), racer.parent_quality))
            })
            .collect()
    }

    /// Race every rung's cohort once. Rungs run in ascending order and a
    /// promotion enters the next rung's cohort immediately, so a strong
    /// candidate can climb the whole ladder within one round.
    pub async fn run_round(
        &mut self,
        evaluator: &Evaluator,
        sampler: &ShardSampler,
        round: u64,
        events: &EventLog,
    ) -> RoundOutcome {
        let mut outcome = RoundOutcome::default();
        for rung_index in 0..self.rungs.len() {
            let mut cohort = Vec::new();
            while cohort.len() < self.batch_size {
                let Some(mut racer) = self.queues[rung_index].pop_front() else {
                    break;
                };
                racer.state = RaceState::Racing(rung_index);
                cohort.push(racer);
            }
            if cohort.is_empty() {
                continue;
            }
            let rung = self.rungs[rung_index].clone();
            let ids = sampler.shard_ids(rung.fraction, round, rung_index);
            for racer in &cohort {
                record_event(
                    events,
                    round,
                    EventKind::EvalStart {
                        fingerprint: racer.fingerprint.clone(),
                        rung: rung_index,
                        examples: ids.len(),
                    },
                );
            }
            let shards = join_all(
                cohort
                    .iter()
                    .map(|racer| evaluator.evaluate(&racer.candidate, &ids, racer.parent_quality)),
            )
            .await;

            let mut survivors: Vec<(Racer, ShardResult)> = Vec::new();
            for (mut racer, shard) in cohort.into_iter().zip(shards) {
                record_event(
                    events,
                    round,
                    EventKind::EvalDone {
                        fingerprint: racer.fingerprint.clone(),
                        rung: rung_index,
                        means: shard.means.clone(),
                        duration_ms: shard.duration_ms,
                    },
                );
                outcome.failure_ids.extend(shard.failure_ids.iter().cloned());
                if shard.is_structural_failure() {
                    racer.state = RaceState::Pruned(rung_index);
                    self.tracked.remove(&racer.fingerprint);
                    outcome.pruned += 1;
                    continue;
                }
                survivors.push((racer, shard));
            }

            if rung_index == self.top_rung() {
                for (mut racer, shard) in survivors {
                    racer.state = RaceState::FullyEvaluated;
                    self.tracked.remove(&racer.fingerprint);
                    outcome.finished.push((racer.candidate, shard));
                }
                continue;
            }

            let entries: Vec<PromotionEntry> = survivors
                .iter()
                .map(|(racer, shard)| PromotionEntry {
                    mean: shard.objective(&self.promote_objective),
                    quality: shard.objective(QUALITY),
                    neg_cost: shard.objective(NEG_COST),
                    fingerprint: racer.fingerprint.clone(),
                    parent_quality: racer.parent_quality,
                })
                .collect();
            let promoted = select_promotions(&entries, rung.promotion_quantile, rung.eps_improve);
            for (index, (mut racer, shard)) in survivors.into_iter().enumerate() {
                if promoted.contains(&index) {
                    racer.state = RaceState::Promoted(rung_index + 1);
                    record_event(
                        events,
                        round,
                        EventKind::Promote {
                            fingerprint: racer.fingerprint.clone(),
                            from_rung: rung_index,
                            to_rung: rung_index + 1,
                            mean: shard.objective(&self.promote_objective),
                        },
                    );
                    outcome.promotions += 1;
                    self.queues[rung_index + 1].push_back(racer);
                } else {
                    racer.state = RaceState::Pruned(rung_index);
                    self.tracked.remove(&racer.fingerprint);
                    outcome.pruned += 1;
                }
            }
        }
        outcome
    }
}
