//! Run controller: plan fan-out, shared run state, final report.
//!
//! Schedules one task runner per plan item under a bounded concurrency
//! limit, funnels every record through the mutex-guarded `RunState`, and
//! finalizes the run with a single atomic manifest write. `completed`
//! flips exactly once, after that write has been confirmed.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use soundpipe_core::config::ConfigError;
use soundpipe_core::plan::{self, PlanError};
use soundpipe_core::report::{self, Manifest, ReportError};
use soundpipe_core::{naming, Config, RunId, RunState, TaskStatus};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::task;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Overall verdict of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// Manifest written and every task succeeded.
    CompletedSuccessfully,
    /// Anything else: failed tasks, a failed manifest write, or a
    /// cancelled run.
    CompletedWithErrors,
}

impl RunVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompletedSuccessfully => "completed_successfully",
            Self::CompletedWithErrors => "completed_with_errors",
        }
    }
}

/// Everything a caller needs after a run has finished.
#[derive(Debug)]
pub struct RunOutcome {
    pub verdict: RunVerdict,
    pub run_id: RunId,
    pub out_dir: PathBuf,
    /// Present when the manifest write succeeded.
    pub manifest_path: Option<PathBuf>,
    pub manifest: Manifest,
}

/// Drives one run end to end.
#[derive(Debug)]
pub struct RunController {
    config: Arc<Config>,
}

impl RunController {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Execute a full run from a plan file.
    ///
    /// An unreadable plan or missing collaborator commands abort before
    /// any task is scheduled. Task-level failures never surface as
    /// errors here; they live in the records and the verdict.
    pub async fn execute(
        &self,
        plan_path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let plan = plan::load_plan(plan_path)?;
        self.config.require_commands()?;

        let started_at = Utc::now();
        let run_id = RunId::new();
        let out_dir = self
            .config
            .out_dir
            .join(naming::run_dir_name(started_at, &plan.theme));
        std::fs::create_dir_all(&out_dir)?;

        info!(
            run_id = %run_id,
            out_dir = %out_dir.display(),
            samples = plan.samples.len(),
            workers = self.config.workers,
            "run started"
        );

        let state = Arc::new(Mutex::new(RunState::new(
            run_id.clone(),
            plan.theme.clone(),
            out_dir.clone(),
        )));
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));

        let mut handles = Vec::with_capacity(plan.samples.len());
        for (index, item) in plan.samples.into_iter().enumerate() {
            let config = Arc::clone(&self.config);
            let state = Arc::clone(&state);
            let semaphore = Arc::clone(&semaphore);
            let out_dir = out_dir.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                // A closed semaphore cannot happen; treat it like an
                // immediate cancellation if it somehow does.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let record = task::run_task(index, item, &out_dir, &config, &cancel).await;
                state.lock().await.tasks.push(record);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "task runner panicked");
                state
                    .lock()
                    .await
                    .run_errors
                    .push(format!("task runner panicked: {e}"));
            }
        }

        let finished_at = Utc::now();
        let mut state = state.lock().await;
        let (manifest, manifest_path) =
            finalize(&mut state, started_at, finished_at, cancel.is_cancelled());

        let verdict = verdict(&state);
        info!(
            run_id = %run_id,
            status = verdict.as_str(),
            succeeded = manifest.counts.succeeded,
            failed = manifest.counts.failed,
            planned = manifest.counts.planned,
            "run finished"
        );

        Ok(RunOutcome {
            verdict,
            run_id,
            out_dir,
            manifest_path,
            manifest,
        })
    }
}

/// Build and persist the manifest, then settle the completion flag.
///
/// The write is attempted even for a cancelled run (the partial records
/// are worth keeping), but a cancelled run is never marked completed.
fn finalize(
    state: &mut RunState,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
    cancelled: bool,
) -> (Manifest, Option<PathBuf>) {
    if cancelled {
        state
            .run_errors
            .push("run cancelled before completion".to_string());
    }

    let mut manifest = report::build_manifest(state, started_at, finished_at);

    match report::write_manifest(&state.out_dir, &manifest) {
        Ok(path) => {
            if !cancelled {
                state.completed = true;
            }
            (manifest, Some(path))
        }
        Err(e) => {
            let message = report_failure_message(&e);
            warn!(error = %e, "manifest write failed");
            state.run_errors.push(message.clone());
            manifest.run_errors.push(message);
            (manifest, None)
        }
    }
}

fn report_failure_message(err: &ReportError) -> String {
    format!("manifest write failed: {err}")
}

/// `completed_successfully` iff the manifest was durably written and
/// every task reached `Success`.
fn verdict(state: &RunState) -> RunVerdict {
    let all_succeeded = !state.tasks.is_empty()
        && state.tasks.iter().all(|t| t.status == TaskStatus::Success);
    if state.completed && all_succeeded && state.run_errors.is_empty() {
        RunVerdict::CompletedSuccessfully
    } else {
        RunVerdict::CompletedWithErrors
    }
}
