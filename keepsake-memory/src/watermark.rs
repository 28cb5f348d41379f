//! Per-session transcript cursors
//!
//! One JSON file per session under the watermark directory. Every write goes
//! to a temp file that is then persisted over the old one, so a crash never
//! leaves a torn watermark behind. Advances hold an exclusive lock on a
//! per-session `.lock` file, which serializes extraction workers running in
//! separate processes.

use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Persisted cursor for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWatermark {
    pub session_id: String,
    /// Number of transcript lines already processed; the next unseen line
    /// has this index.
    pub last_processed_line: usize,
    pub updated_at: DateTime<Utc>,
}

/// Reads and advances session watermarks
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    dir: PathBuf,
}

/// Session ids come from outside; only keep filename-safe characters
fn sanitize(session_id: &str) -> Result<String> {
    let cleaned: String = session_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return Err(Error::invalid_input(format!(
            "Unusable session id: {:?}",
            session_id
        )));
    }
    Ok(cleaned)
}

impl WatermarkTracker {
    pub fn new(config: &Config) -> Self {
        Self::at(config.watermark_dir())
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.json", sanitize(session_id)?)))
    }

    fn open_lock(&self, path: &Path) -> Result<fd_lock::RwLock<fs::File>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;
        Ok(fd_lock::RwLock::new(file))
    }

    /// Current watermark, if the session has one. An unreadable file counts
    /// as no watermark.
    pub fn read(&self, session_id: &str) -> Result<Option<SessionWatermark>> {
        let path = self.path_for(session_id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<SessionWatermark>(&raw) {
            Ok(watermark) => Ok(Some(watermark)),
            Err(e) => {
                warn!(session_id, error = %e, "ignoring corrupt watermark");
                Ok(None)
            }
        }
    }

    /// Last processed line, 0 for an unknown session
    pub fn last_processed_line(&self, session_id: &str) -> Result<usize> {
        Ok(self
            .read(session_id)?
            .map(|w| w.last_processed_line)
            .unwrap_or(0))
    }

    /// Move the cursor forward. Returns `false` without writing when
    /// `new_line` is not past the current position. Blocks while another
    /// tracker, in this process or any other, advances the same session.
    pub fn advance(&self, session_id: &str, new_line: usize) -> Result<bool> {
        let path = self.path_for(session_id)?;
        fs::create_dir_all(&self.dir)?;
        let mut lock = self.open_lock(&path)?;
        let _guard = lock.write()?;

        let current = self.read(session_id)?.map(|w| w.last_processed_line);
        if matches!(current, Some(line) if new_line <= line) {
            debug!(session_id, new_line, ?current, "watermark not advanced");
            return Ok(false);
        }

        let watermark = SessionWatermark {
            session_id: session_id.to_string(),
            last_processed_line: new_line,
            updated_at: Utc::now(),
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".watermark")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(serde_json::to_string_pretty(&watermark)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(session_id, new_line, "watermark advanced");
        Ok(true)
    }

    /// Lines of a `total_lines` transcript not yet processed. A session seen
    /// for the first time gets its most recent `max_lines` lines.
    pub fn unseen_range(
        &self,
        session_id: &str,
        total_lines: usize,
        max_lines: usize,
    ) -> Result<Range<usize>> {
        match self.read(session_id)? {
            Some(watermark) => {
                let start = watermark.last_processed_line.min(total_lines);
                Ok(start..total_lines)
            }
            None => Ok(total_lines.saturating_sub(max_lines)..total_lines),
        }
    }

    /// Delete watermark files not modified within `max_age`. Best effort:
    /// individual failures are logged and skipped.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let max_age = max_age.to_std().unwrap_or_default();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if ![".json", ".tmp", ".lock"].iter().any(|ext| name.ends_with(ext)) {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat watermark");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale watermark"),
            }
        }

        if removed > 0 {
            debug!(removed, "swept stale watermarks");
        }
        Ok(removed)
    }
}
