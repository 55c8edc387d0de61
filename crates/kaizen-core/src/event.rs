//! Append-only JSONL event stream, one file per island.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::candidate::{Fingerprint, Origin};
use crate::{io_err, CoreError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub island: usize,
    pub round: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    EvalStart {
        fingerprint: Fingerprint,
        rung: usize,
        examples: usize,
    },
    EvalDone {
        fingerprint: Fingerprint,
        rung: usize,
        means: BTreeMap<String, f64>,
        duration_ms: u64,
    },
    Promote {
        fingerprint: Fingerprint,
        from_rung: usize,
        to_rung: usize,
        mean: f64,
    },
    ArchiveUpdate {
        fingerprint: Fingerprint,
        origin: Origin,
        pareto_accepted: bool,
        qd_accepted: bool,
    },
    MutationProposed {
        fingerprint: Fingerprint,
        origin: Origin,
        parent: Option<Fingerprint>,
    },
    MutationAccepted {
        fingerprint: Fingerprint,
        origin: Origin,
    },
    MergeProposed {
        left: Fingerprint,
        right: Fingerprint,
        child: Fingerprint,
    },
    MergeAccepted {
        child: Fingerprint,
        uplift: f64,
    },
    MergeRejected {
        child: Fingerprint,
        uplift: f64,
    },
    CompressionApplied {
        original: Fingerprint,
        compressed: Fingerprint,
        saved_tokens: u64,
    },
    MigrateOut {
        to_island: usize,
        count: usize,
        dropped: usize,
    },
    MigrateIn {
        count: usize,
        admitted: usize,
    },
    Summary {
        queue_depth: usize,
        pareto_size: usize,
        qd_filled: usize,
        evaluations: u64,
        cache_hit_rate: f64,
        objectives: BTreeMap<String, ObjectiveStats>,
        hypervolume: f64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl ObjectiveStats {
    pub fn from_samples(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        Some(Self {
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
        })
    }
}

/// JSONL writer for one island's event stream. Appends are serialized with
/// an internal lock; each line is flushed before the lock is released.
pub struct EventLog {
    path: PathBuf,
    island_id: usize,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>, island_id: usize) -> Self {
        let dir = dir.into();
        Self {
            path: dir.join(format!("island_{island_id}.jsonl")),
            island_id,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn emit(&self, round: u64, kind: EventKind) -> Result<(), CoreError> {
        let record = EventRecord {
            ts: Utc::now().to_rfc3339(),
            island: self.island_id,
            round,
            kind,
        };
        let line = serde_json::to_string(&record).map_err(|err| CoreError::Serde(err.to_string()))?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CoreError::Io("event log lock poisoned".into()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }

    /// Full scan of the stream; blank lines are skipped, a torn final line
    /// is reported as a serialization error.
    pub fn read_all(&self) -> Result<Vec<EventRecord>, CoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CoreError::Io("event log lock poisoned".into()))?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(io_err)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<EventRecord>(&line)
                .map_err(|err| CoreError::Serde(err.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}
