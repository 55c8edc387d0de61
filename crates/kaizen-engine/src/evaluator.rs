//! Bounded-concurrency evaluation fabric over the task oracle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;

use kaizen_cache::DiskCache;
use kaizen_core::{
    eval_key, Candidate, Dataset, EvaluationResult, ExampleId, IslandConfig, ShardResult,
    TaskOracle, Trace, NEG_COST, QUALITY, TOKENS,
};

const RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Default)]
struct ShardProgress {
    completed: usize,
    quality_sum: f64,
    aborted: bool,
}

/// Executes (candidate, example) scoring calls with the cache consulted
/// first. At most `eval_concurrency` oracle calls are in flight; cache hits
/// bypass the semaphore entirely.
pub struct Evaluator {
    oracle: Arc<dyn TaskOracle>,
    dataset: Arc<dyn Dataset>,
    cache: Arc<DiskCache>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    timeout: Option<Duration>,
    failure_threshold: f64,
    trace_cap: usize,
    eps_improve: f64,
    shard_version: u32,
    oracle_calls: Arc<AtomicU64>,
    tokens_spent: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl Evaluator {
    pub fn new(
        oracle: Arc<dyn TaskOracle>,
        dataset: Arc<dyn Dataset>,
        cache: Arc<DiskCache>,
        config: &IslandConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            oracle,
            dataset,
            cache,
            semaphore: Arc::new(Semaphore::new(config.eval_concurrency.max(1))),
            max_retries: config.max_retries,
            timeout: config.eval_timeout_ms.map(Duration::from_millis),
            failure_threshold: config.failure_threshold,
            trace_cap: config.trace_cap,
            eps_improve: config.eps_improve,
            shard_version: config.shard_version,
            oracle_calls: Arc::new(AtomicU64::new(0)),
            tokens_spent: Arc::new(AtomicU64::new(0)),
            stop,
        }
    }

    /// Total oracle invocations since construction, including retries.
    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls.load(Ordering::Relaxed)
    }

    /// Cumulative token spend reported by fresh scoring calls. Cache hits
    /// add nothing.
    pub fn tokens_spent(&self) -> u64 {
        self.tokens_spent.load(Ordering::Relaxed)
    }

    /// Evaluate one candidate over the given example ids. Returns once every
    /// id has produced a result, exhausted its retries, or been skipped by
    /// cancellation or the parent-target early stop. The aggregate mean is
    /// exact over the produced results.
    pub async fn evaluate(
        &self,
        candidate: &Candidate,
        ids: &[ExampleId],
        parent_quality: Option<f64>,
    ) -> ShardResult {
        let started = Instant::now();
        let fingerprint = candidate.fingerprint();
        let total = ids.len();
        let parent_target = parent_quality.map(|q| (q + self.eps_improve).clamp(0.0, 1.0));
        let progress = Mutex::new(ShardProgress::default());

        let produced: Vec<EvaluationResult> = join_all(ids.iter().map(|id| {
            self.eval_one(&fingerprint, &candidate.text, id, total, parent_target, &progress)
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        ShardResult::aggregate(&produced, started.elapsed().as_millis() as u64)
    }

    async fn eval_one(
        &self,
        fingerprint: &str,
        text: &str,
        id: &ExampleId,
        total: usize,
        parent_target: Option<f64>,
        progress: &Mutex<ShardProgress>,
    ) -> Option<EvaluationResult> {
        let key = eval_key(fingerprint, id, self.shard_version);
        if let Some(cached) = self.cache.get(&key) {
            self.register(progress, &cached, total, parent_target);
            return Some(cached);
        }
        if self.stop.load(Ordering::Relaxed) || self.is_aborted(progress) {
            return None;
        }
        let Some(payload) = self.dataset.payload(id) else {
            let result =
                EvaluationResult::structural_failure(id.clone(), "unknown example id", self.trace_cap);
            self.register(progress, &result, total, parent_target);
            return Some(result);
        };

        let Ok(_permit) = self.semaphore.acquire().await else {
            return None;
        };
        // Re-check after the permit wait: cancellation or an early stop may
        // have landed while this id was queued.
        if self.stop.load(Ordering::Relaxed) || self.is_aborted(progress) {
            return None;
        }
        let mut attempt = 0u32;
        let result = loop {
            self.oracle_calls.fetch_add(1, Ordering::Relaxed);
            let call = self.oracle.score(text, &payload);
            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(inner) => inner,
                    Err(_) => Err(kaizen_core::OracleError::Transient(
                        "oracle call timed out".into(),
                    )),
                },
                None => call.await,
            };
            match outcome {
                Ok(score) => {
                    self.tokens_spent
                        .fetch_add(score.tokens.max(0.0) as u64, Ordering::Relaxed);
                    let mut objectives = BTreeMap::new();
                    objectives.insert(QUALITY.to_string(), score.quality);
                    objectives.insert(NEG_COST.to_string(), score.neg_cost);
                    objectives.insert(TOKENS.to_string(), score.tokens);
                    let trace = score
                        .trace
                        .map(|payload| Trace::new(id.clone(), payload, self.trace_cap));
                    let result = EvaluationResult::new(
                        id.clone(),
                        objectives,
                        trace,
                        self.failure_threshold,
                    );
                    if let Err(err) = self.cache.put(&key, &result) {
                        tracing::warn!(key = %key, error = %err, "cache write rejected");
                    }
                    break result;
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS << attempt.min(6);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                // Permanent errors and exhausted retries become structural
                // failures; they are not cached so a later run may retry.
                Err(err) => {
                    break EvaluationResult::structural_failure(
                        id.clone(),
                        err.to_string(),
                        self.trace_cap,
                    );
                }
            }
        };
        self.register(progress, &result, total, parent_target);
        Some(result)
    }

    fn register(
        &self,
        progress: &Mutex<ShardProgress>,
        result: &EvaluationResult,
        total: usize,
        parent_target: Option<f64>,
    ) {
        let Ok(mut state) = progress.lock() else {
            return;
        };
        state.completed += 1;
        state.quality_sum += result.objective(QUALITY);
        if let Some(target) = parent_target {
            if !state.aborted && total > 0 {
                let remaining = total.saturating_sub(state.completed) as f64;
                let best_possible = (state.quality_sum + remaining) / total as f64;
                if best_possible + 1e-9 < target {
                    state.aborted = true;
                }
            }
        }
    }

    fn is_aborted(&self, progress: &Mutex<ShardProgress>) -> bool {
        progress.lock().map(|state| state.aborted).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use kaizen_core::{InMemoryDataset, OracleError, TaskScore};

    fn temp_root(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("kaizen-evaluator-{name}-{nanos:x}"))
    }

    fn dataset(n: usize) -> Arc<InMemoryDataset> {
        Arc::new(InMemoryDataset::new(
            (0..n)
                .map(|i| (format!("ex-{i:03}"), serde_json::json!({ "i": i })))
                .collect(),
        ))
    }

    struct CountingOracle {
        calls: AtomicU32,
        quality: f64,
    }

    #[async_trait]
    impl TaskOracle for CountingOracle {
        async fn score(&self, _text: &str, _example: &serde_json::Value) -> Result<TaskScore, OracleError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(TaskScore {
                quality: self.quality,
                neg_cost: -1.0,
                tokens: 12.0,
                trace: Some("ok".into()),
            })
        }
    }

    struct FlakyOracle {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskOracle for FlakyOracle {
        async fn score(&self, _text: &str, _example: &serde_json::Value) -> Result<TaskScore, OracleError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.fail_first {
                return Err(OracleError::Transient("blip".into()));
            }
            Ok(TaskScore {
                quality: 1.0,
                neg_cost: -1.0,
                tokens: 4.0,
                trace: None,
            })
        }
    }

    struct BrokenOracle;

    #[async_trait]
    impl TaskOracle for BrokenOracle {
        async fn score(&self, _text: &str, _example: &serde_json::Value) -> Result<TaskScore, OracleError> {
            Err(OracleError::Permanent("no such model".into()))
        }
    }

    fn evaluator(oracle: Arc<dyn TaskOracle>, dataset: Arc<InMemoryDataset>, name: &str) -> Evaluator {
        let config = IslandConfig::default();
        Evaluator::new(
            oracle,
            dataset,
            Arc::new(DiskCache::new(temp_root(name))),
            &config,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn second_pass_is_served_from_cache() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicU32::new(0),
            quality: 0.9,
        });
        let data = dataset(5);
        let evaluator = evaluator(oracle.clone(), data.clone(), "cache");
        let ids = data.ids();
        let candidate = Candidate::seed("answer briefly");

        let first = evaluator.evaluate(&candidate, &ids, None).await;
        assert_eq!(first.count, 5);
        assert_eq!(oracle.calls.load(Ordering::Relaxed), 5);
        assert_eq!(evaluator.tokens_spent(), 60);

        let second = evaluator.evaluate(&candidate, &ids, None).await;
        assert_eq!(second.count, 5);
        assert_eq!(oracle.calls.load(Ordering::Relaxed), 5);
        // Cache hits do not grow the token spend.
        assert_eq!(evaluator.tokens_spent(), 60);
        assert!((second.objective(QUALITY) - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let oracle = Arc::new(FlakyOracle {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let data = dataset(1);
        let evaluator = evaluator(oracle, data.clone(), "retry");
        let shard = evaluator
            .evaluate(&Candidate::seed("retry me"), &data.ids(), None)
            .await;
        assert_eq!(shard.count, 1);
        assert!(!shard.is_structural_failure());
        assert!((shard.objective(QUALITY) - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn permanent_errors_become_structural_failures() {
        let data = dataset(2);
        let evaluator = evaluator(Arc::new(BrokenOracle), data.clone(), "permanent");
        let shard = evaluator
            .evaluate(&Candidate::seed("doomed"), &data.ids(), None)
            .await;
        assert_eq!(shard.count, 2);
        assert_eq!(shard.structural_failures, 2);
        assert_eq!(shard.objective(QUALITY), 0.0);
        assert!(!shard.failure_traces.is_empty());
    }

    #[tokio::test]
    async fn structural_failures_are_not_cached() {
        let data = dataset(1);
        let root = temp_root("nocache");
        let cache = Arc::new(DiskCache::new(&root));
        let config = IslandConfig::default();
        let evaluator = Evaluator::new(
            Arc::new(BrokenOracle),
            data.clone(),
            cache.clone(),
            &config,
            Arc::new(AtomicBool::new(false)),
        );
        evaluator
            .evaluate(&Candidate::seed("doomed"), &data.ids(), None)
            .await;
        let candidate = Candidate::seed("doomed");
        let key = eval_key(&candidate.fingerprint(), &data.ids()[0], config.shard_version);
        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn hopeless_candidates_stop_early() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicU32::new(0),
            quality: 0.0,
        });
        let data = dataset(64);
        let config = IslandConfig::default().with_eval_concurrency(1);
        let evaluator = Evaluator::new(
            oracle.clone(),
            data.clone(),
            Arc::new(DiskCache::new(temp_root("earlystop"))),
            &config,
            Arc::new(AtomicBool::new(false)),
        );
        // Parent quality 1.0 is unreachable once a single zero lands.
        let shard = evaluator
            .evaluate(&Candidate::seed("weak child"), &data.ids(), Some(1.0))
            .await;
        assert!(shard.count < 64);
        assert!((oracle.calls.load(Ordering::Relaxed) as usize) < 64);
    }

    #[tokio::test]
    async fn stop_flag_skips_pending_work() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicU32::new(0),
            quality: 1.0,
        });
        let data = dataset(8);
        let stop = Arc::new(AtomicBool::new(true));
        let config = IslandConfig::default();
        let evaluator = Evaluator::new(
            oracle.clone(),
            data.clone(),
            Arc::new(DiskCache::new(temp_root("stop"))),
            &config,
            stop,
        );
        let shard = evaluator
            .evaluate(&Candidate::seed("cancelled"), &data.ids(), None)
            .await;
        assert_eq!(shard.count, 0);
        assert_eq!(oracle.calls.load(Ordering::Relaxed), 0);
    }
}
