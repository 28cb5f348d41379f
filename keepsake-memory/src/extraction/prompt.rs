//! Summarization prompt construction

use std::fmt::Write as _;

use crate::storage::truncate_chars;
use crate::transcript::Turn;

const OPENER_CHARS: usize = 600;

/// Instructions sent as the system prompt to every backend
pub const SYSTEM_PROMPT: &str = "You distill coding-session transcripts into durable engineering \
observations. Reply with strict JSON only, no prose and no code fences.";

/// A fully built summarization request
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    pub system: String,
    pub prompt: String,
    /// Upper bound on response tokens
    pub max_tokens: u32,
}

/// Build the request from the selected turns and the session opener
pub fn build_prompt(
    turns: &[Turn],
    opener: Option<&str>,
    max_observations: usize,
    max_turn_chars: usize,
    max_tokens: u32,
) -> SummaryRequest {
    let mut prompt = String::new();

    if let Some(opener) = opener.map(str::trim).filter(|o| !o.is_empty()) {
        let _ = writeln!(
            prompt,
            "The session began with this request:\n<opener>\n{}\n</opener>\n",
            truncate_chars(opener, OPENER_CHARS)
        );
    }

    prompt.push_str("Recent turns:\n");
    for turn in turns {
        let _ = writeln!(
            prompt,
            "<turn line=\"{}\" role=\"{}\">\n{}\n</turn>",
            turn.line,
            turn.role,
            truncate_chars(&turn.text, max_turn_chars)
        );
    }

    let _ = write!(
        prompt,
        "\nReturn a JSON array of 0 to {max} observations worth remembering in later sessions: \
decisions and their reasons, tradeoffs, conventions, pitfalls, and facts about the codebase. \
Skip chit-chat and anything already obvious from the code. Each element:\n\
{{\"content\": string, \"content_type\": one of \"observation\" | \"pattern\" | \"summary\" | \
\"learning\" | \"decision\", \"importance_score\": number 0.0-1.0, \
\"relevant_files\": [string], \"scope\": \"project\" | \"global\"}}\n\
Return [] if nothing qualifies.",
        max = max_observations
    );

    SummaryRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        max_tokens,
    }
}
