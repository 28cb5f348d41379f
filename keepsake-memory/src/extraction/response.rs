//! Summarizer response parsing
//!
//! Backends answer with a JSON array of observations. Older prompts asked
//! for a single object (`observation`/`type`/`importance`), and some models
//! wrap the array in an object; all three shapes normalize to one list.

use std::collections::HashSet;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{ContentType, Scope};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawResponse {
    List(Vec<RawObservation>),
    Wrapped {
        #[serde(alias = "items", alias = "results")]
        observations: Vec<RawObservation>,
    },
    Single(RawObservation),
}

#[derive(Debug, Default, Deserialize)]
struct RawObservation {
    #[serde(default, alias = "observation", alias = "text")]
    content: Option<String>,
    #[serde(default, alias = "type", alias = "category")]
    content_type: Option<String>,
    #[serde(default, alias = "importance")]
    importance_score: Option<f32>,
    #[serde(default, alias = "files")]
    relevant_files: Vec<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// One insight in canonical form
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub content: String,
    /// Always a promotable type
    pub content_type: ContentType,
    pub importance_hint: Option<f32>,
    pub relevant_files: Vec<String>,
    pub scope: Option<Scope>,
}

impl RawObservation {
    fn normalize(self) -> Option<Observation> {
        let content = self.content?.trim().to_string();
        if content.is_empty() {
            return None;
        }

        let content_type = self
            .content_type
            .as_deref()
            .and_then(|t| ContentType::from_str(t).ok())
            .filter(ContentType::is_promotable)
            .unwrap_or(ContentType::Observation);

        let importance_hint = self
            .importance_score
            .filter(|score| score.is_finite())
            .map(|score| score.clamp(0.0, 1.0));

        let relevant_files = self
            .relevant_files
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let scope = self.scope.as_deref().and_then(|s| Scope::from_str(s).ok());

        Some(Observation {
            content,
            content_type,
            importance_hint,
            relevant_files,
            scope,
        })
    }
}

/// The JSON payload inside a reply: fences removed, leading and trailing
/// prose cut away.
fn json_payload(reply: &str) -> &str {
    let mut text = reply.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        text = rest.trim_end().trim_end_matches("```").trim();
    }

    let start = text.find(['[', '{']);
    let end = text.rfind([']', '}']);
    match (start, end) {
        (Some(start), Some(end)) if start <= end => &text[start..=end],
        _ => text,
    }
}

/// Parse a reply into at most `max` distinct observations
pub fn parse_observations(reply: &str, max: usize) -> Result<Vec<Observation>> {
    let payload = json_payload(reply);
    let raw: RawResponse = serde_json::from_str(payload)
        .map_err(|e| Error::backend(format!("Unparseable summarizer reply: {}", e)))?;

    let raw = match raw {
        RawResponse::List(list) => list,
        RawResponse::Wrapped { observations } => observations,
        RawResponse::Single(single) => {
            debug!("summarizer used the single-object schema");
            vec![single]
        }
    };

    let mut seen = HashSet::new();
    Ok(raw
        .into_iter()
        .filter_map(RawObservation::normalize)
        .filter(|obs| seen.insert(obs.content.to_lowercase()))
        .take(max)
        .collect())
}
