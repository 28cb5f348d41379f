//! Configuration for keepsake-memory
//!
//! One `Config` value is loaded at startup and handed to each component's
//! constructor. Nothing in the crate reads configuration from globals.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SETTINGS_FILE: &str = "settings.json";

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all index storage
    pub data_dir: PathBuf,

    /// Root of the durable (file-backed) tier. Defaults to `<data_dir>/durable`.
    pub durable_dir: Option<PathBuf>,

    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub promotion: PromotionConfig,
    pub extraction: ExtractionConfig,
    pub backend: BackendConfig,

    /// Reject writes whose content looks like credential material
    pub secret_detection: bool,

    /// Compute importance with the scorer when the caller gives none
    pub importance_scoring: bool,

    /// Watermarks untouched for longer than this are swept on session start
    pub watermark_stale_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keepsake");

        Self {
            data_dir,
            durable_dir: None,
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            promotion: PromotionConfig::default(),
            extraction: ExtractionConfig::default(),
            backend: BackendConfig::default(),
            secret_detection: true,
            importance_scoring: true,
            watermark_stale_days: 30,
        }
    }
}

/// Which embedder backs the vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local all-MiniLM-L6-v2 via fastembed
    Fastembed,
    /// Deterministic feature hashing, no model download
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub hash_dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Fastembed,
            hash_dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum similarity (0.0 - 1.0) for an item to be considered relevant
    pub threshold: f32,
    pub max_results: usize,
    /// Total characters the injected context block may occupy
    pub budget_chars: usize,
    /// Upper bound for a single durable-tier reference line
    pub reference_chars: usize,
    /// Items created within this window get a ranking boost
    pub recency_window_days: i64,
    pub recency_boost: f32,
    /// Hard deadline for per-prompt retrieval
    pub timeout_ms: u64,
    /// Prompts shorter than this inject nothing
    pub min_prompt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            max_results: 5,
            budget_chars: 8000,
            reference_chars: 120,
            recency_window_days: 7,
            recency_boost: 0.1,
            timeout_ms: 800,
            min_prompt_chars: 10,
        }
    }
}

/// What happens to the ephemeral shadow when a promoted item's durable file
/// disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableDeletePolicy {
    /// Forget the durable record; a kept shadow becomes a plain ephemeral item
    Detach,
    /// Forget the durable record and delete the shadow as well
    Cascade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub importance_threshold: f32,
    /// Eligible when `retrieval_count` is strictly greater than this
    pub retrieval_count_threshold: u32,
    pub age_importance_days: i64,
    pub age_importance_score: f32,
    /// Keep the ephemeral row after promotion instead of deleting it
    pub keep_ephemeral_copy: bool,
    pub on_durable_delete: DurableDeletePolicy,
    /// Promotable type -> directory under the durable root
    pub type_dirs: BTreeMap<String, String>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        let type_dirs = [
            ("observation", "observations"),
            ("pattern", "patterns"),
            ("summary", "summaries"),
            ("learning", "learnings"),
            ("decision", "decisions"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            importance_threshold: 0.8,
            retrieval_count_threshold: 3,
            age_importance_days: 7,
            age_importance_score: 0.5,
            keep_ephemeral_copy: false,
            on_durable_delete: DurableDeletePolicy::Detach,
            type_dirs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub enabled: bool,
    /// Turns shorter than this are not substantive
    pub min_turn_chars: usize,
    /// Individual turns are clipped to this length inside the prompt
    pub max_turn_chars: usize,
    /// Slice cap for a session seen for the first time
    pub max_transcript_lines: usize,
    pub max_observations: usize,
    /// Case-insensitive substrings marking turns about the memory system itself
    pub skip_patterns: Vec<String>,
    /// Summary budget as a fraction of the output tokens in the slice
    pub output_budget_ratio: f32,
    pub min_budget_tokens: u32,
    pub max_budget_tokens: u32,
    /// How long a turn hash stays in the in-process seen-set
    pub seen_ttl_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_turn_chars: 40,
            max_turn_chars: 2000,
            max_transcript_lines: 400,
            max_observations: 3,
            skip_patterns: vec![
                "<memory-context>".to_string(),
                "keepsake ".to_string(),
                "memory extraction".to_string(),
                "extract observations".to_string(),
                "observation:".to_string(),
            ],
            output_budget_ratio: 0.25,
            min_budget_tokens: 256,
            max_budget_tokens: 1024,
            seen_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub api_enabled: bool,
    /// OpenAI-compatible base URL; `/chat/completions` is appended
    pub api_base_url: String,
    pub api_model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub api_timeout_secs: u64,

    pub cli_enabled: bool,
    /// Local command that reads a prompt on stdin and prints the reply
    pub cli_command: String,
    pub cli_args: Vec<String>,
    pub cli_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_enabled: true,
            api_base_url: "https://api.anthropic.com/v1".to_string(),
            api_model: "claude-haiku-4-5".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_timeout_secs: 20,
            cli_enabled: true,
            cli_command: "claude".to_string(),
            cli_args: vec!["-p".to_string()],
            cli_timeout_secs: 60,
        }
    }
}

impl BackendConfig {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load settings from a JSON file. A missing file yields the defaults;
    /// `KEEPSAKE_DATA_DIR` overrides the data directory either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::default_data_dir().join(SETTINGS_FILE));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Config>(&raw).map_err(|e| {
                Error::config(format!("Invalid settings file {}: {}", path.display(), e))
            })?
        } else {
            Config::default()
        };

        if let Some(dir) = std::env::var_os("KEEPSAKE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn default_data_dir() -> PathBuf {
        std::env::var_os("KEEPSAKE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| Config::default().data_dir)
    }

    /// Reject settings that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.threshold) {
            return Err(Error::config("retrieval.threshold must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.promotion.importance_threshold) {
            return Err(Error::config(
                "promotion.importance_threshold must be within 0.0..=1.0",
            ));
        }
        if self.embedding.hash_dimensions == 0 {
            return Err(Error::config("embedding.hash_dimensions must be non-zero"));
        }
        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Directory holding one watermark file per session
    pub fn watermark_dir(&self) -> PathBuf {
        self.data_dir.join("watermarks")
    }

    /// Root of the durable tier file tree
    pub fn durable_root(&self) -> PathBuf {
        self.durable_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("durable"))
    }

    /// Cache directory for downloaded embedding models
    pub fn model_cache_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        std::fs::create_dir_all(self.watermark_dir())?;
        std::fs::create_dir_all(self.durable_root())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.retrieval.budget_chars, 8000);
        assert_eq!(config.retrieval.max_results, 5);
        assert!((config.retrieval.threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.extraction.max_observations, 3);
        assert_eq!(config.watermark_stale_days, 30);
        assert_eq!(
            config.promotion.type_dirs.get("decision").map(String::as_str),
            Some("decisions")
        );
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"retrieval": {"budget_chars": 1000}, "promotion": {"on_durable_delete": "cascade"}}"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.retrieval.budget_chars, 1000);
        assert_eq!(config.retrieval.max_results, 5);
        assert_eq!(config.promotion.on_durable_delete, DurableDeletePolicy::Cascade);
        assert!(config.secret_detection);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retrieval": {"threshold": 1.5}}"#).unwrap();

        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn durable_root_defaults_under_data_dir() {
        let config = Config::with_data_dir("/tmp/keepsake-test");
        assert_eq!(config.durable_root(), PathBuf::from("/tmp/keepsake-test/durable"));
        assert_eq!(
            config.sqlite_path(),
            PathBuf::from("/tmp/keepsake-test/metadata.db")
        );
    }
}
