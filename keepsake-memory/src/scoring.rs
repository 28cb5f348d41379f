//! Importance scoring from structural signals
//!
//! Pure and deterministic: the current time is an argument, never read
//! internally.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::memory::{ContentItem, ContentType};

const SIGNAL_WEIGHT: f32 = 0.08;
const HINT_WEIGHT: f32 = 0.5;
const DECAY_FLOOR: f32 = 0.6;
const FREQUENCY_WEIGHT: f32 = 0.06;
const FREQUENCY_CAP: f32 = 0.25;

/// Inputs to a fresh score
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub content: &'a str,
    pub item_type: ContentType,
    /// Importance suggested by the summarizer, if any
    pub hint: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub retrieval_count: u32,
}

/// Importance scorer
#[derive(Debug, Clone)]
pub struct Scorer {
    /// Days for the recency factor to fall halfway to its floor
    half_life_days: f32,
}

impl Default for Scorer {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
        }
    }
}

struct SignalPatterns {
    reasoning: Regex,
    tradeoff: Regex,
    entity: Regex,
}

fn signal_patterns() -> Option<&'static SignalPatterns> {
    static PATTERNS: OnceLock<Option<SignalPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(SignalPatterns {
                reasoning: Regex::new(
                    r"(?i)\b(because|therefore|so that|due to|in order to|which means|the reason|since the)\b",
                )
                .ok()?,
                tradeoff: Regex::new(
                    r"(?i)\b(trade-?offs?|instead of|rather than|versus|vs\.?|pros and cons|at the cost of|downside|upside)\b",
                )
                .ok()?,
                entity: Regex::new(
                    r"`[^`\n]{2,}`|\b[\w./-]+\.(?:rs|py|ts|tsx|js|go|java|md|toml|json|ya?ml|sql|sh)\b|\b[A-Z][a-z]+[A-Z][A-Za-z]+\b",
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Default importance for a content type before any signals
pub fn base_weight(item_type: ContentType) -> f32 {
    match item_type {
        ContentType::Decision => 0.70,
        ContentType::Learning => 0.65,
        ContentType::Memory => 0.60,
        ContentType::Pattern => 0.60,
        ContentType::Plan => 0.55,
        ContentType::Summary => 0.50,
        ContentType::Relationship => 0.50,
        ContentType::Snippet => 0.45,
        ContentType::Observation => 0.40,
        ContentType::Hint => 0.40,
        ContentType::Note => 0.35,
    }
}

/// Bonus for explicit reasoning, named tradeoffs, and named entities
pub fn signal_bonus(content: &str) -> f32 {
    let Some(patterns) = signal_patterns() else {
        return 0.0;
    };
    [&patterns.reasoning, &patterns.tradeoff, &patterns.entity]
        .into_iter()
        .filter(|regex| regex.is_match(content))
        .count() as f32
        * SIGNAL_WEIGHT
}

impl Scorer {
    pub fn new(half_life_days: f32) -> Self {
        Self {
            half_life_days: half_life_days.max(1.0),
        }
    }

    /// Score content from scratch
    pub fn score(&self, input: &ScoreInput<'_>, now: DateTime<Utc>) -> f32 {
        let structural = (base_weight(input.item_type) + signal_bonus(input.content)).min(1.0);
        let prior = match input.hint {
            Some(hint) => (1.0 - HINT_WEIGHT) * structural + HINT_WEIGHT * hint.clamp(0.0, 1.0),
            None => structural,
        };
        self.adjust(
            prior,
            input.created_at,
            input.last_retrieved_at,
            input.retrieval_count,
            now,
        )
    }

    /// Re-evaluate a stored item; its stored importance is the prior.
    /// Age and retrieval count have moved since it was written.
    pub fn rescore(&self, item: &ContentItem, now: DateTime<Utc>) -> f32 {
        let meta = &item.metadata;
        self.adjust(
            meta.importance,
            meta.created_at,
            meta.last_retrieved_at,
            meta.retrieval_count,
            now,
        )
    }

    fn adjust(
        &self,
        prior: f32,
        created_at: DateTime<Utc>,
        last_retrieved_at: Option<DateTime<Utc>>,
        retrieval_count: u32,
        now: DateTime<Utc>,
    ) -> f32 {
        // Decay only while nobody has come back for the item
        let recency = if retrieval_count == 0 {
            let reference = last_retrieved_at.unwrap_or(created_at);
            let age_days = (now - reference).num_seconds().max(0) as f32 / 86_400.0;
            let decay = 0.5f32.powf(age_days / self.half_life_days);
            DECAY_FLOOR + (1.0 - DECAY_FLOOR) * decay
        } else {
            1.0
        };

        let frequency =
            (FREQUENCY_WEIGHT * (1.0 + retrieval_count as f32).ln()).min(FREQUENCY_CAP);

        (prior * recency + frequency).clamp(0.0, 1.0)
    }
}
