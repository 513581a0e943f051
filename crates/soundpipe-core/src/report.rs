//! Manifest building and durable persistence.
//!
//! The manifest is the run's single durable report: one entry per task
//! plus aggregate counts and timing. It is built once, after every task
//! has settled, and written atomically (temp file, then rename). The
//! run's `completed` flag must only flip after the write returns Ok.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::{ArtifactRef, RunState, TaskStatus};

/// Filename of the manifest within the run directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregate counts over a run's tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures keyed by the stage they are attributed to.
    pub failed_by_stage: BTreeMap<String, usize>,
}

/// One task's entry in the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestTask {
    pub id: String,
    pub seed_description: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    pub error_log: Vec<String>,
}

/// The durable, final aggregation of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub run_id: String,
    pub theme: String,
    pub out_dir: PathBuf,
    pub counts: Counts,
    pub tasks: Vec<ManifestTask>,
    pub run_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_duration_ms: i64,
}

/// Build a manifest from a settled run state.
pub fn build_manifest(
    state: &RunState,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Manifest {
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut failed_by_stage: BTreeMap<String, usize> = BTreeMap::new();

    let mut tasks: Vec<ManifestTask> = Vec::with_capacity(state.tasks.len());
    for record in &state.tasks {
        match &record.status {
            TaskStatus::Success => succeeded += 1,
            TaskStatus::Failed { stage } => {
                failed += 1;
                *failed_by_stage.entry(stage.as_str().to_string()).or_insert(0) += 1;
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }
        tasks.push(ManifestTask {
            id: record.item.id.clone(),
            seed_description: record.item.seed_description.clone(),
            status: record.status.clone(),
            attempts: record.attempts,
            artifact: record.artifact.clone(),
            error_log: record.error_log.clone(),
        });
    }

    // Entries are appended in completion order under concurrency; the
    // manifest lists them in plan order.
    let mut order: Vec<usize> = (0..state.tasks.len()).collect();
    order.sort_by_key(|&i| state.tasks[i].index);
    let tasks = order.into_iter().map(|i| tasks[i].clone()).collect();

    Manifest {
        run_id: state.id.to_string(),
        theme: state.theme.clone(),
        out_dir: state.out_dir.clone(),
        counts: Counts {
            planned: state.tasks.len(),
            succeeded,
            failed,
            failed_by_stage,
        },
        tasks,
        run_errors: state.run_errors.clone(),
        started_at,
        finished_at,
        total_duration_ms: (finished_at - started_at).num_milliseconds(),
    }
}

/// Atomically persist a manifest next to the run's artifacts.
///
/// Writes to a sibling temp file and renames into place so a crash or a
/// full disk never leaves a truncated manifest behind. Returns the final
/// path on success.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<PathBuf, ReportError> {
    let json = serde_json::to_string_pretty(manifest)?;

    let final_path = dir.join(MANIFEST_FILENAME);
    let tmp_path = dir.join(format!("{MANIFEST_FILENAME}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;

    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanItem, RunId, StageName, TaskRecord};

    fn record(index: usize, id: &str, status: TaskStatus, attempts: u32) -> TaskRecord {
        let mut record = TaskRecord::new(
            index,
            PlanItem {
                id: id.to_string(),
                seed_description: format!("sample {id}"),
                duration_s: 2.0,
            },
        );
        record.status = status;
        record.attempts = attempts;
        record
    }

    fn settled_state() -> RunState {
        let mut state = RunState::new(RunId::new(), "test theme", PathBuf::from("/tmp/run"));
        state.tasks.push(record(1, "A2", TaskStatus::Success, 3));
        state.tasks.push(record(0, "A1", TaskStatus::Success, 1));
        state.tasks.push(record(
            2,
            "A3",
            TaskStatus::Failed {
                stage: StageName::Compile,
            },
            11,
        ));
        state
    }

    #[test]
    fn counts_are_aggregated() {
        let state = settled_state();
        let now = Utc::now();
        let manifest = build_manifest(&state, now, now);

        assert_eq!(manifest.counts.planned, 3);
        assert_eq!(manifest.counts.succeeded, 2);
        assert_eq!(manifest.counts.failed, 1);
        assert_eq!(manifest.counts.failed_by_stage.get("compile"), Some(&1));
    }

    #[test]
    fn tasks_are_listed_in_plan_order() {
        let state = settled_state();
        let now = Utc::now();
        let manifest = build_manifest(&state, now, now);

        let ids: Vec<&str> = manifest.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "A2", "A3"]);
    }

    #[test]
    fn manifest_serializes_status_inline() {
        let state = settled_state();
        let now = Utc::now();
        let manifest = build_manifest(&state, now, now);
        let json = serde_json::to_string(&manifest).unwrap();

        assert!(json.contains("\"status\":\"FAILED\""));
        assert!(json.contains("\"stage\":\"compile\""));
    }

    #[test]
    fn write_manifest_creates_file_and_removes_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = settled_state();
        let now = Utc::now();
        let manifest = build_manifest(&state, now, now);

        let path = write_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(path, dir.path().join(MANIFEST_FILENAME));
        assert!(path.exists());
        assert!(!dir.path().join("manifest.json.tmp").exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["counts"]["planned"], 3);
    }

    #[test]
    fn write_manifest_fails_on_missing_dir() {
        let state = settled_state();
        let now = Utc::now();
        let manifest = build_manifest(&state, now, now);

        let err = write_manifest(Path::new("/nonexistent/run/dir"), &manifest).unwrap_err();
        assert!(matches!(err, ReportError::Io(_)));
    }
}
