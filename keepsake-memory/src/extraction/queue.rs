//! Fire-and-forget submission of extraction jobs
//!
//! Callers hand a job to a queue and move on. `TaskQueue` runs jobs on the
//! current tokio runtime; `DetachedProcessQueue` hands each job to a fresh
//! worker process so the submitting process can exit immediately.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExtractionJob, ExtractionPipeline};
use crate::error::{Error, Result};

/// Accepts extraction jobs without waiting for their outcome
pub trait ExtractionQueue: Send + Sync {
    fn submit(&self, job: ExtractionJob) -> Result<()>;
}

/// Runs each job as a tokio task in this process
pub struct TaskQueue {
    pipeline: Arc<ExtractionPipeline>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(pipeline: Arc<ExtractionPipeline>) -> Self {
        Self {
            pipeline,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every submitted job. Only needed before process exit and in
    /// tests; submitters never call this.
    pub async fn drain(&self) {
        let handles: Vec<_> = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handles.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "extraction task panicked");
            }
        }
    }
}

impl ExtractionQueue for TaskQueue {
    fn submit(&self, job: ExtractionJob) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::backend(format!("no async runtime for extraction: {}", e)))?;

        let pipeline = self.pipeline.clone();
        let handle = runtime.spawn(async move {
            match pipeline.run(&job).await {
                Ok(report) => debug!(
                    session_id = %report.session_id,
                    stored = report.stored_ids.len(),
                    "background extraction finished"
                ),
                Err(e) => warn!(session_id = %job.session_id, error = %e, "background extraction failed"),
            }
        });

        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }
}

/// Spawns `<program> extract ...` detached from the caller
#[derive(Debug, Clone)]
pub struct DetachedProcessQueue {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl DetachedProcessQueue {
    pub fn new(program: impl Into<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path,
        }
    }

    /// Re-invoke the running binary as the worker
    pub fn current_exe(config_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }

    /// Worker command line for a job
    pub fn command(&self, job: &ExtractionJob) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("extract")
            .arg("--session")
            .arg(&job.session_id)
            .arg("--transcript")
            .arg(&job.transcript_path);
        if let Some(dir) = &job.project.project_dir {
            cmd.arg("--cwd").arg(dir);
        }
        if let Some(branch) = &job.project.branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group: the worker outlives the hook that spawned it
        // and never receives the terminal's signals.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl ExtractionQueue for DetachedProcessQueue {
    fn submit(&self, job: ExtractionJob) -> Result<()> {
        let child = self.command(&job).spawn()?;
        debug!(session_id = %job.session_id, pid = child.id(), "spawned extraction worker");
        Ok(())
    }
}
