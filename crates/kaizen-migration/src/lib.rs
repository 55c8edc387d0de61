//! Migrant exchange between island processes arranged in a ring.
//!
//! Each island owns an inbox directory; island *i* sends by writing
//! envelope files into the inbox of island *(i + 1) mod N*. Queues are
//! single-producer/single-consumer, non-blocking, and bounded with
//! drop-oldest overflow. There are no acknowledgments and no ordering
//! guarantee between distinct migration events.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use kaizen_core::Fingerprint;

pub const PROTOCOL: &str = "kaizen-ring";
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

fn io_err(err: std::io::Error) -> MigrationError {
    MigrationError::Io(err.to_string())
}

/// One elite shipped to the next island. The objective snapshot and hop
/// count ride along for observability; admission decisions re-race the
/// text from rung zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Migrant {
    pub text: String,
    pub fingerprint: Fingerprint,
    pub objectives: BTreeMap<String, f64>,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrantEnvelope {
    pub protocol: String,
    pub protocol_version: String,
    pub sender_island: usize,
    pub message_id: String,
    pub timestamp: String,
    pub migrants: Vec<Migrant>,
    pub content_hash: String,
}

impl MigrantEnvelope {
    pub fn new(sender_island: usize, migrants: Vec<Migrant>) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut envelope = Self {
            protocol: PROTOCOL.into(),
            protocol_version: PROTOCOL_VERSION.into(),
            sender_island,
            message_id: format!("msg-{nanos:x}"),
            timestamp: Utc::now().to_rfc3339(),
            migrants,
            content_hash: String::new(),
        };
        envelope.content_hash = envelope.compute_content_hash();
        envelope
    }

    pub fn compute_content_hash(&self) -> String {
        let payload = (
            &self.protocol,
            &self.protocol_version,
            &self.sender_island,
            &self.message_id,
            &self.timestamp,
            &self.migrants,
        );
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json);
        hex::encode(hasher.finalize())
    }

    pub fn verify_content_hash(&self) -> bool {
        self.compute_content_hash() == self.content_hash
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SendOutcome {
    pub to_island: usize,
    /// Envelopes evicted from the receiver's inbox to make room.
    pub dropped: usize,
}

/// Directory-backed queues for one island. `drain` reads the island's own
/// inbox; `send` writes into the ring successor's inbox.
pub struct RingChannel {
    root: PathBuf,
    island_id: usize,
    n_islands: usize,
    queue_limit: usize,
    seq: AtomicU64,
}

impl RingChannel {
    pub fn new(
        root: impl Into<PathBuf>,
        island_id: usize,
        n_islands: usize,
        queue_limit: usize,
    ) -> Self {
        Self {
            root: root.into(),
            island_id,
            n_islands: n_islands.max(1),
            queue_limit: queue_limit.max(1),
            seq: AtomicU64::new(0),
        }
    }

    fn inbox_dir(&self, island: usize) -> PathBuf {
        self.root.join(format!("island_{island}")).join("inbox")
    }

    /// Ring successor. With a single island the channel loops back to
    /// itself, so sends surface in the island's own next drain.
    pub fn next_island(&self) -> usize {
        (self.island_id + 1) % self.n_islands
    }

    fn queued_files(&self, island: usize) -> Result<Vec<PathBuf>, MigrationError> {
        let dir = self.inbox_dir(island);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Non-blocking send with drop-oldest overflow. Never propagates a
    /// full-queue condition to the caller.
    pub fn send(&self, envelope: &MigrantEnvelope) -> Result<SendOutcome, MigrationError> {
        let to_island = self.next_island();
        let dir = self.inbox_dir(to_island);
        fs::create_dir_all(&dir).map_err(io_err)?;

        let mut dropped = 0usize;
        let queued = self.queued_files(to_island)?;
        if queued.len() >= self.queue_limit {
            for stale in queued.iter().take(queued.len() + 1 - self.queue_limit) {
                if fs::remove_file(stale).is_ok() {
                    dropped += 1;
                }
            }
            tracing::warn!(to_island, dropped, "outbox full, dropped oldest envelopes");
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{nanos:020}-{:04}-{seq:06}.json", self.island_id);
        let bytes =
            serde_json::to_vec(envelope).map_err(|err| MigrationError::Serde(err.to_string()))?;
        let tmp = dir.join(format!("{name}.tmp"));
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, dir.join(name)).map_err(io_err)?;
        Ok(SendOutcome { to_island, dropped })
    }

    /// Non-blocking drain of the island's own inbox. Corrupt or tampered
    /// envelopes are discarded with a warning.
    pub fn drain(&self) -> Result<Vec<MigrantEnvelope>, MigrationError> {
        let mut envelopes = Vec::new();
        for path in self.queued_files(self.island_id)? {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable envelope skipped");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            let _ = fs::remove_file(&path);
            match serde_json::from_slice::<MigrantEnvelope>(&bytes) {
                Ok(envelope) if envelope.verify_content_hash() => envelopes.push(envelope),
                Ok(envelope) => {
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        "envelope content hash mismatch, discarded"
                    );
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "corrupt envelope discarded");
                }
            }
        }
        Ok(envelopes)
    }

    pub fn inbox_depth(&self) -> usize {
        self.queued_files(self.island_id)
            .map(|files| files.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("kaizen-migration-{name}-{nanos:x}"))
    }

    fn migrant(text: &str) -> Migrant {
        Migrant {
            text: text.to_string(),
            fingerprint: kaizen_core::candidate_fingerprint(text),
            objectives: BTreeMap::from([("quality".to_string(), 0.9)]),
            hop_count: 0,
        }
    }

    #[test]
    fn envelope_hash_round_trips_and_detects_tampering() {
        let envelope = MigrantEnvelope::new(0, vec![migrant("be concise")]);
        assert!(envelope.verify_content_hash());
        let mut tampered = envelope.clone();
        tampered.migrants[0].text = "be verbose".into();
        assert!(!tampered.verify_content_hash());
    }

    #[test]
    fn ring_delivers_to_successor() {
        let root = temp_root("ring");
        let sender = RingChannel::new(&root, 0, 2, 8);
        let receiver = RingChannel::new(&root, 1, 2, 8);
        sender
            .send(&MigrantEnvelope::new(0, vec![migrant("a")]))
            .unwrap();
        assert!(sender.drain().unwrap().is_empty());
        let received = receiver.drain().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender_island, 0);
        // Drain consumes.
        assert!(receiver.drain().unwrap().is_empty());
    }

    #[test]
    fn single_island_ring_loops_back_to_itself() {
        let channel = RingChannel::new(temp_root("solo"), 0, 1, 8);
        assert_eq!(channel.next_island(), 0);
        channel
            .send(&MigrantEnvelope::new(0, vec![migrant("self")]))
            .unwrap();
        let received = channel.drain().unwrap();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let root = temp_root("overflow");
        let sender = RingChannel::new(&root, 0, 2, 2);
        let receiver = RingChannel::new(&root, 1, 2, 2);
        sender
            .send(&MigrantEnvelope::new(0, vec![migrant("first")]))
            .unwrap();
        sender
            .send(&MigrantEnvelope::new(0, vec![migrant("second")]))
            .unwrap();
        let outcome = sender
            .send(&MigrantEnvelope::new(0, vec![migrant("third")]))
            .unwrap();
        assert_eq!(outcome.dropped, 1);
        let received = receiver.drain().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].migrants[0].text, "second");
        assert_eq!(received[1].migrants[0].text, "third");
    }

    #[test]
    fn tampered_file_is_discarded_on_drain() {
        let root = temp_root("tamper");
        let sender = RingChannel::new(&root, 0, 2, 8);
        let receiver = RingChannel::new(&root, 1, 2, 8);
        sender
            .send(&MigrantEnvelope::new(0, vec![migrant("x")]))
            .unwrap();
        let files = receiver.queued_files(1).unwrap();
        let contents = fs::read_to_string(&files[0]).unwrap();
        fs::write(&files[0], contents.replace("\"x\"", "\"y\"")).unwrap();
        assert!(receiver.drain().unwrap().is_empty());
    }
}
