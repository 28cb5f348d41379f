//! Budgeted context injection for incoming prompts
//!
//! Relevant items are packed into a `<memory-context>` block under a fixed
//! character budget. Half the budget belongs to durable-tier references and
//! half to ephemeral-tier content; whatever one pool leaves unused the other
//! may take. This path never counts as a retrieval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::memory::{MemoryStore, ScoredItem, SemanticQuery, Tier};
use crate::storage::{heading, truncate_chars, DurableStorage};

const OPEN_TAG: &str = "<memory-context>\n";
const CLOSE_TAG: &str = "</memory-context>\n";
const DURABLE_HEADER: &str = "Durable notes (open the file for details):\n";
const EPHEMERAL_HEADER: &str = "Recent observations:\n";
/// Smallest useful slice of ephemeral content
const MIN_EPHEMERAL_CHARS: usize = 40;

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compact reference line for a durable item, at most `max_chars` long
fn reference_line(result: &ScoredItem, durable: &DurableStorage, max_chars: usize) -> String {
    let item = &result.item;
    let location = item
        .durable_path
        .as_deref()
        .map(|p| durable.display_path(p))
        .unwrap_or_else(|| item.id.clone());
    let line = format!("- {}: {}", location, heading(&item.content));
    format!("{}\n", truncate_chars(&line, max_chars))
}

/// Line for an ephemeral item with its content clipped to fit `room`
fn content_line(result: &ScoredItem, room: usize) -> Option<String> {
    let prefix = format!("- [{}] ", result.item.metadata.item_type);
    let overhead = char_len(&prefix) + 1;
    if room < overhead + MIN_EPHEMERAL_CHARS.min(char_len(&result.item.content)) {
        return None;
    }
    let body = truncate_chars(&collapse_whitespace(&result.item.content), room - overhead);
    Some(format!("{}{}\n", prefix, body))
}

fn pool_need(lines: &[String], header: &str) -> usize {
    if lines.is_empty() {
        0
    } else {
        char_len(header) + lines.iter().map(|l| char_len(l)).sum::<usize>()
    }
}

/// Fill one pool with whole lines, best first
fn fill_references(lines: Vec<String>, alloc: usize) -> String {
    let mut out = String::new();
    let mut used = char_len(DURABLE_HEADER);
    for line in lines {
        let len = char_len(&line);
        if used + len > alloc {
            continue;
        }
        used += len;
        out.push_str(&line);
    }
    if out.is_empty() {
        out
    } else {
        format!("{}{}", DURABLE_HEADER, out)
    }
}

fn fill_contents(results: &[&ScoredItem], alloc: usize) -> String {
    let mut out = String::new();
    let mut used = char_len(EPHEMERAL_HEADER);
    for result in results {
        let Some(room) = alloc.checked_sub(used) else {
            break;
        };
        let Some(line) = content_line(result, room) else {
            break;
        };
        used += char_len(&line);
        out.push_str(&line);
    }
    if out.is_empty() {
        out
    } else {
        format!("{}{}", EPHEMERAL_HEADER, out)
    }
}

/// Pack ranked results into a context block no longer than `budget`
/// characters. Returns an empty string when nothing fits.
pub fn pack(
    results: &[ScoredItem],
    budget: usize,
    reference_chars: usize,
    durable: &DurableStorage,
) -> String {
    let wrapper = char_len(OPEN_TAG) + char_len(CLOSE_TAG);
    if results.is_empty() || budget <= wrapper {
        return String::new();
    }
    let available = budget - wrapper;
    let half = available / 2;

    let durable_lines: Vec<String> = results
        .iter()
        .filter(|r| r.item.tier == Tier::Durable)
        .map(|r| reference_line(r, durable, reference_chars))
        .collect();
    let ephemeral: Vec<&ScoredItem> = results
        .iter()
        .filter(|r| r.item.tier == Tier::Ephemeral)
        .collect();
    let ephemeral_full: Vec<String> = ephemeral
        .iter()
        .map(|r| {
            format!(
                "- [{}] {}\n",
                r.item.metadata.item_type,
                collapse_whitespace(&r.item.content)
            )
        })
        .collect();

    let durable_need = pool_need(&durable_lines, DURABLE_HEADER);
    let ephemeral_need = pool_need(&ephemeral_full, EPHEMERAL_HEADER);

    // Each pool starts with half; unused room rolls over to the other
    let durable_first = durable_need.min(half);
    let ephemeral_alloc = ephemeral_need.min(available - durable_first);
    let durable_alloc = durable_need.min(available - ephemeral_alloc);

    let references = fill_references(durable_lines, durable_alloc);
    let contents = fill_contents(&ephemeral, ephemeral_alloc);
    if references.is_empty() && contents.is_empty() {
        return String::new();
    }

    let block = format!("{}{}{}{}", OPEN_TAG, references, contents, CLOSE_TAG);
    debug_assert!(char_len(&block) <= budget);
    block
}

/// Builds the per-prompt context block
pub struct RetrievalBudgeter {
    store: Arc<MemoryStore>,
}

impl RetrievalBudgeter {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Open the store and build context for `prompt` under one deadline.
    /// Model load, index open, and search all count against
    /// `retrieval.timeout_ms`; missing it yields an empty string.
    pub async fn open_and_build(config: Config, prompt: &str, project_dir: Option<&str>) -> String {
        let timeout_ms = config.retrieval.timeout_ms.max(1);
        let work = async {
            let store = MemoryStore::new(config).await?;
            let block = Self::new(Arc::new(store))
                .build_context(prompt, project_dir)
                .await;
            Ok::<_, crate::error::Error>(block)
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
            Ok(Ok(block)) => block,
            Ok(Err(e)) => {
                warn!(error = %e, "memory store unavailable, injecting nothing");
                String::new()
            }
            Err(_) => {
                warn!(timeout_ms, "prompt context timed out, injecting nothing");
                String::new()
            }
        }
    }

    /// Context for `prompt`, or an empty string. Never fails: errors and
    /// timeouts degrade to no context.
    pub async fn build_context(&self, prompt: &str, project_dir: Option<&str>) -> String {
        let config = &self.store.config().retrieval;
        let prompt = prompt.trim();
        if char_len(prompt) < config.min_prompt_chars {
            return String::new();
        }

        let mut query = SemanticQuery::new(prompt, config.max_results).with_threshold(config.threshold);
        query.project_dir = project_dir.map(str::to_string);

        let deadline = Duration::from_millis(config.timeout_ms.max(1));
        let results = match tokio::time::timeout(deadline, self.store.search_uncounted(&query)).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(error = %e, "context retrieval failed, injecting nothing");
                return String::new();
            }
            Err(_) => {
                warn!(timeout_ms = config.timeout_ms, "context retrieval timed out, injecting nothing");
                return String::new();
            }
        };

        let block = pack(
            &results,
            config.budget_chars,
            config.reference_chars,
            self.store.durable(),
        );
        debug!(
            candidates = results.len(),
            chars = char_len(&block),
            "built prompt context"
        );
        block
    }
}
