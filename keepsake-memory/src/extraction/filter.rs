//! Turn filtering: length floor, anti-recursion skip list, seen-set dedup

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::ExtractionConfig;
use crate::transcript::Turn;

/// Hex sha256 of text with case and whitespace runs normalized
pub fn content_hash(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Decides which turns are worth summarizing
#[derive(Debug, Clone)]
pub struct TurnFilter {
    min_chars: usize,
    skip_patterns: Vec<String>,
}

impl TurnFilter {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            min_chars: config.min_turn_chars,
            skip_patterns: config
                .skip_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.trim().is_empty())
                .collect(),
        }
    }

    /// Long enough, and not about the memory system itself
    pub fn is_substantive(&self, turn: &Turn) -> bool {
        if turn.text.chars().count() < self.min_chars {
            return false;
        }
        let lower = turn.text.to_lowercase();
        !self.skip_patterns.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Substantive turns not in `seen` and not repeated within the slice,
    /// each paired with its content hash.
    pub fn select(&self, turns: Vec<Turn>, seen: &SeenSet) -> Vec<(Turn, String)> {
        let mut in_slice = HashSet::new();
        turns
            .into_iter()
            .filter(|turn| self.is_substantive(turn))
            .filter_map(|turn| {
                let hash = content_hash(&turn.text);
                if seen.contains(&hash) || !in_slice.insert(hash.clone()) {
                    None
                } else {
                    Some((turn, hash))
                }
            })
            .collect()
    }
}

/// Short-lived record of turn hashes already summarized by this process.
/// Hashes are committed only after their observations were stored.
#[derive(Debug, Clone)]
pub struct SeenSet {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl SeenSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, at| at.elapsed() < ttl);
        entries.contains_key(hash)
    }

    pub fn commit<'a>(&self, hashes: impl IntoIterator<Item = &'a str>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        for hash in hashes {
            entries.insert(hash.to_string(), now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;

    fn turn(line: usize, text: &str) -> Turn {
        Turn {
            line,
            role: Role::Assistant,
            text: text.to_string(),
            tool_files: Vec::new(),
        }
    }

    fn filter() -> TurnFilter {
        TurnFilter::new(&ExtractionConfig {
            min_turn_chars: 20,
            ..Default::default()
        })
    }

    #[test]
    fn hash_ignores_case_and_spacing() {
        assert_eq!(content_hash("Hello   World"), content_hash("hello world\n"));
        assert_ne!(content_hash("hello world"), content_hash("hello there"));
    }

    #[test]
    fn short_and_self_referential_turns_are_dropped() {
        let f = filter();
        assert!(!f.is_substantive(&turn(0, "ok thanks")));
        assert!(!f.is_substantive(&turn(
            0,
            "<memory-context>\n- observation:abc something old\n</memory-context>"
        )));
        assert!(f.is_substantive(&turn(
            0,
            "Switched the retry policy to exponential backoff"
        )));
    }

    #[test]
    fn select_dedups_within_slice_and_against_seen() {
        let f = filter();
        let seen = SeenSet::new(Duration::from_secs(60));
        let a = "The parser now rejects trailing commas in arrays";
        let b = "Moved config loading into a dedicated module";
        seen.commit([content_hash(b).as_str()]);

        let selected = f.select(vec![turn(0, a), turn(1, a), turn(2, b)], &seen);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.line, 0);
    }

    #[test]
    fn seen_entries_expire() {
        let seen = SeenSet::new(Duration::from_millis(0));
        seen.commit(["abc"]);
        assert!(!seen.contains("abc"));
        assert!(seen.is_empty());
    }
}
