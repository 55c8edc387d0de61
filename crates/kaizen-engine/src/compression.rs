//! Rule-based token compression of archived elites.

use kaizen_core::{estimate_tokens, normalize_text, Candidate, IslandConfig, Origin};

const FILLER_WORDS: [&str; 10] = [
    "please", "very", "really", "simply", "basically", "actually", "kindly", "just", "quite",
    "rather",
];

fn strip_fillers(line: &str) -> String {
    line.split_whitespace()
        .filter(|word| {
            let bare = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            !FILLER_WORDS.contains(&bare.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shorten a text without touching its structure-bearing markers: filler
/// words go, duplicate lines collapse, blank runs shrink to one.
fn shorten(text: &str) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    let mut blank_pending = false;
    for line in text.lines() {
        let stripped = strip_fillers(line);
        if stripped.trim().is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if seen.contains(&stripped) {
            continue;
        }
        if blank_pending {
            out.push(String::new());
            blank_pending = false;
        }
        seen.push(stripped.clone());
        out.push(stripped);
    }
    out.join("\n")
}

/// Proposes compressed variants of archived elites and decides acceptance.
/// A variant is validated on a reduced shard; it is accepted iff its
/// promotion-objective mean lands within `prune_delta` of the original on
/// that same shard. Accepted variants become new archive entries; the
/// original is retained.
pub struct TokenController {
    objective: String,
    prune_delta: f64,
    shard_fraction: f64,
}

impl TokenController {
    pub fn new(config: &IslandConfig) -> Self {
        Self {
            objective: config.compression_objective.clone(),
            prune_delta: config.prune_delta,
            shard_fraction: config.compression_shard_fraction,
        }
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn shard_fraction(&self) -> f64 {
        self.shard_fraction
    }

    /// A compressed copy of the elite, or None when shortening achieves
    /// nothing.
    pub fn propose(&self, original: &Candidate) -> Option<Candidate> {
        let compressed = shorten(&original.text);
        if normalize_text(&compressed) == normalize_text(&original.text) {
            return None;
        }
        if estimate_tokens(&compressed) >= original.token_estimate {
            return None;
        }
        Some(Candidate::child(
            compressed,
            Origin::Compression,
            vec![original.fingerprint()],
        ))
    }

    pub fn accepts(&self, original_mean: f64, compressed_mean: f64) -> bool {
        compressed_mean + self.prune_delta >= original_mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TokenController {
        TokenController::new(&IslandConfig::default())
    }

    #[test]
    fn shortening_removes_fillers_and_duplicates() {
        let text = "please answer very carefully\n\n\nanswer carefully\nshow the working";
        let compressed = shorten(text);
        assert_eq!(compressed, "answer carefully\n\nshow the working");
    }

    #[test]
    fn proposal_keeps_parent_link_and_reduces_tokens() {
        let controller = controller();
        let original = Candidate::seed(
            "please think very carefully about the question\njust explain the result simply",
        );
        let compressed = controller.propose(&original).expect("should shorten");
        assert_eq!(compressed.origin, Origin::Compression);
        assert_eq!(compressed.parents, vec![original.fingerprint()]);
        assert!(compressed.token_estimate < original.token_estimate);
        assert!(!compressed.text.contains("please"));
    }

    #[test]
    fn incompressible_text_yields_no_proposal() {
        let controller = controller();
        assert!(controller.propose(&Candidate::seed("solve for x")).is_none());
    }

    #[test]
    fn structure_markers_survive_compression() {
        let controller = controller();
        let original =
            Candidate::seed("please work step by step\n- check the input really closely\n- respond");
        let compressed = controller.propose(&original).expect("should shorten");
        assert!(compressed.text.contains("step by step"));
        assert!(compressed.text.contains("- check the input closely"));
    }

    #[test]
    fn acceptance_is_within_prune_delta() {
        let controller = controller();
        assert!(controller.accepts(0.80, 0.80));
        assert!(controller.accepts(0.80, 0.797));
        assert!(!controller.accepts(0.80, 0.79));
        assert!(controller.accepts(0.80, 0.95));
    }
}
