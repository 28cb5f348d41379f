//! Summarization budget sized by how much the assistant actually wrote

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::transcript::{Role, Turn};

/// Token counter backed by tiktoken's cl100k tables
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// Claude tokenizes close enough to cl100k for budgeting
    pub fn for_claude() -> Result<Self> {
        Self::new("gpt-4")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Estimate tokens without using the tokenizer
    pub fn estimate(text: &str) -> u32 {
        // ~4 characters per token
        text.len().div_ceil(4) as u32
    }
}

/// Count with the tokenizer when available, else estimate
pub fn count_tokens(counter: Option<&TokenCounter>, text: &str) -> u32 {
    match counter {
        Some(counter) => counter.count(text),
        None => TokenCounter::estimate(text),
    }
}

/// Output-token budget for the summary: a fraction of the assistant output
/// in the selected turns, clamped to the configured range.
pub fn summary_budget(
    counter: Option<&TokenCounter>,
    turns: &[Turn],
    config: &ExtractionConfig,
) -> u32 {
    let output_tokens: u32 = turns
        .iter()
        .filter(|t| t.role == Role::Assistant)
        .map(|t| count_tokens(counter, &t.text))
        .sum();

    let scaled = (output_tokens as f32 * config.output_budget_ratio).ceil() as u32;
    let max = config.max_budget_tokens.max(config.min_budget_tokens);
    scaled.clamp(config.min_budget_tokens, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, text: String) -> Turn {
        Turn {
            line: 0,
            role,
            text,
            tool_files: Vec::new(),
        }
    }

    #[test]
    fn budget_follows_output_not_input() {
        let config = ExtractionConfig::default();
        let huge_user = turn(Role::User, "word ".repeat(20_000));
        let small_reply = turn(Role::Assistant, "done".to_string());

        let budget = summary_budget(None, &[huge_user, small_reply], &config);
        assert_eq!(budget, config.min_budget_tokens);
    }

    #[test]
    fn budget_is_capped() {
        let config = ExtractionConfig::default();
        let long_reply = turn(Role::Assistant, "x".repeat(100_000));
        assert_eq!(
            summary_budget(None, &[long_reply], &config),
            config.max_budget_tokens
        );
    }

    #[test]
    fn budget_scales_between_bounds() {
        let config = ExtractionConfig::default();
        // 8000 chars ~ 2000 tokens -> 500 at a 0.25 ratio
        let reply = turn(Role::Assistant, "y".repeat(8000));
        assert_eq!(summary_budget(None, &[reply], &config), 500);
    }

    #[test]
    fn tokenizer_counts_words() {
        let counter = TokenCounter::for_claude().unwrap();
        let count = counter.count("Hello, world!");
        assert!(count > 0 && count < 10);
    }
}
