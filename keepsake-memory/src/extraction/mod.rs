//! Passive insight extraction from conversation transcripts
//!
//! A run takes the unseen slice of one session's transcript, keeps the
//! substantive turns, asks a summarization backend for a handful of
//! observations, stores them in the ephemeral tier, and only then moves the
//! session watermark past the slice. A crash anywhere before the final step
//! means the slice is processed again, never that it is lost; deterministic
//! observation ids make the repeat an in-place update.

pub mod backend;
pub mod budget;
pub mod filter;
pub mod prompt;
pub mod queue;
pub mod response;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::memory::{MemoryStore, ProjectContext, Scope, StoreRequest, Tier};
use crate::transcript;
use crate::watermark::WatermarkTracker;

pub use backend::{ApiBackend, CliBackend, FallbackBackend, SummarizationBackend, EXTRACTING_ENV};
pub use budget::{summary_budget, TokenCounter};
pub use filter::{content_hash, SeenSet, TurnFilter};
pub use prompt::{build_prompt, SummaryRequest};
pub use queue::{DetachedProcessQueue, ExtractionQueue, TaskQueue};
pub use response::{parse_observations, Observation};

const MAX_FILES_PER_OBSERVATION: usize = 10;

/// One unit of extraction work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub session_id: String,
    pub transcript_path: PathBuf,
    #[serde(default)]
    pub project: ProjectContext,
}

/// What a run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    pub session_id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub turns_read: usize,
    pub turns_selected: usize,
    pub stored_ids: Vec<String>,
    /// Reply could not be parsed and was dropped
    pub discarded: bool,
    pub watermark_advanced: bool,
}

/// Id for an extracted observation, stable for identical content
pub fn observation_id(content: &str) -> String {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
    format!("observation:{}", &digest[..12])
}

const GLOBAL_MARKERS: [&str; 8] = [
    "in general",
    "generally",
    "always ",
    "never ",
    "best practice",
    "rule of thumb",
    "any project",
    "across projects",
];

/// Project when the insight is tied to files or this repository, global
/// when it reads as a general rule.
pub fn classify_scope(content: &str, files: &[String], project: &ProjectContext) -> Scope {
    if !files.is_empty() {
        return Scope::Project;
    }

    let lower = content.to_lowercase();
    let names_project = project
        .project_dir
        .as_deref()
        .and_then(|dir| Path::new(dir).file_name())
        .map(|name| name.to_string_lossy().to_lowercase())
        .filter(|name| name.len() > 2)
        .is_some_and(|name| lower.contains(&name));
    let names_path = lower.split_whitespace().any(|word| {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.');
        word.contains('/') || (word.contains('.') && word.rsplit('.').next().is_some_and(|ext| {
            matches!(ext, "rs" | "py" | "ts" | "js" | "go" | "toml" | "json" | "md" | "yaml" | "yml")
        }))
    });
    if names_project || names_path {
        return Scope::Project;
    }

    if GLOBAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        Scope::Global
    } else {
        Scope::Project
    }
}

/// Runs extraction for any number of sessions; runs for the same session
/// are serialized.
pub struct ExtractionPipeline {
    store: Arc<MemoryStore>,
    watermarks: WatermarkTracker,
    backend: Arc<dyn SummarizationBackend>,
    filter: TurnFilter,
    seen: SeenSet,
    counter: Option<Arc<TokenCounter>>,
    config: ExtractionConfig,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExtractionPipeline {
    pub fn new(store: Arc<MemoryStore>, backend: Arc<dyn SummarizationBackend>) -> Self {
        let config = store.config().extraction.clone();
        let watermarks = WatermarkTracker::new(store.config());
        let counter = match TokenCounter::for_claude() {
            Ok(counter) => Some(Arc::new(counter)),
            Err(e) => {
                warn!(error = %e, "tokenizer unavailable, estimating token counts");
                None
            }
        };

        Self {
            filter: TurnFilter::new(&config),
            seen: SeenSet::new(Duration::from_secs(config.seen_ttl_secs)),
            store,
            watermarks,
            backend,
            counter,
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Pipeline using the configured backends with fallback
    pub fn from_config(store: Arc<MemoryStore>) -> Self {
        let backend = FallbackBackend::from_config(&store.config().backend);
        Self::new(store, Arc::new(backend))
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    fn gate(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Process the unseen slice of a session's transcript
    pub async fn run(&self, job: &ExtractionJob) -> Result<ExtractionReport> {
        let gate = self.gate(&job.session_id);
        let _guard = gate.lock().await;

        let mut report = ExtractionReport {
            session_id: job.session_id.clone(),
            ..Default::default()
        };
        if !self.config.enabled {
            return Ok(report);
        }

        let total = transcript::count_lines(&job.transcript_path)?;
        let range = self.watermarks.unseen_range(
            &job.session_id,
            total,
            self.config.max_transcript_lines,
        )?;
        report.start_line = range.start;
        report.end_line = range.end;
        if range.is_empty() {
            debug!(session_id = %job.session_id, "no unseen transcript lines");
            return Ok(report);
        }

        let turns = transcript::read_slice(&job.transcript_path, range.clone())?;
        report.turns_read = turns.len();

        let mut slice_files: Vec<String> = Vec::new();
        for file in turns.iter().flat_map(|t| t.tool_files.iter()) {
            if !slice_files.contains(file) {
                slice_files.push(file.clone());
            }
        }

        let selected = self.filter.select(turns, &self.seen);
        report.turns_selected = selected.len();
        if selected.is_empty() {
            report.watermark_advanced = self.advance(&job.session_id, range.end);
            return Ok(report);
        }

        let (selected_turns, hashes): (Vec<_>, Vec<_>) = selected.into_iter().unzip();
        let budget = summary_budget(self.counter.as_deref(), &selected_turns, &self.config);
        let opener = match transcript::first_user_message(&job.transcript_path) {
            Ok(opener) => opener,
            Err(e) => {
                warn!(session_id = %job.session_id, error = %e, "could not read session opener");
                None
            }
        };
        let request = build_prompt(
            &selected_turns,
            opener.as_deref(),
            self.config.max_observations,
            self.config.max_turn_chars,
            budget,
        );

        let reply = self.backend.summarize(&request).await?;

        let observations = match parse_observations(&reply, self.config.max_observations) {
            Ok(observations) => observations,
            Err(e) => {
                warn!(session_id = %job.session_id, error = %e, "discarding summarizer reply");
                report.discarded = true;
                Vec::new()
            }
        };

        for observation in observations {
            match self.persist(observation, &slice_files, &job.project).await {
                Ok(Some(id)) => report.stored_ids.push(id),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        self.seen.commit(hashes.iter().map(String::as_str));
        report.watermark_advanced = self.advance(&job.session_id, range.end);

        info!(
            session_id = %job.session_id,
            lines = %format!("{}..{}", range.start, range.end),
            stored = report.stored_ids.len(),
            "extraction complete"
        );
        Ok(report)
    }

    async fn persist(
        &self,
        observation: Observation,
        slice_files: &[String],
        project: &ProjectContext,
    ) -> Result<Option<String>> {
        let files: Vec<String> = if observation.relevant_files.is_empty() {
            slice_files.to_vec()
        } else {
            observation.relevant_files.clone()
        }
        .into_iter()
        .take(MAX_FILES_PER_OBSERVATION)
        .collect();

        let scope = observation
            .scope
            .unwrap_or_else(|| classify_scope(&observation.content, &observation.relevant_files, project));

        let mut request = StoreRequest::new(observation.content_type, observation.content.clone())
            .with_id(observation_id(&observation.content))
            .with_tier(Tier::Ephemeral)
            .with_tags(vec!["extracted".to_string()])
            .with_project(project.clone())
            .with_relevant_files(files)
            .with_scope(scope);
        if let Some(hint) = observation.importance_hint {
            request = request.with_importance_hint(hint);
        }

        match self.store.store(request).await {
            Ok(item) => Ok(Some(item.id)),
            Err(Error::SecretDetected { kind }) => {
                warn!(kind = %kind, "dropping extracted observation containing a secret");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Watermark write failures are logged, never raised
    fn advance(&self, session_id: &str, line: usize) -> bool {
        match self.watermarks.advance(session_id, line) {
            Ok(advanced) => advanced,
            Err(e) => {
                warn!(session_id, error = %e, "failed to advance watermark");
                false
            }
        }
    }
}
