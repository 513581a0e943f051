//! Core types for the sample-generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a run.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Named pipeline stages, at both granularities.
///
/// `Analyze`, `Compile`, and `Relocate` form the per-sample pipeline;
/// `Generate`, `Execute`, and `Validate` form the pipeline nested inside
/// the Compile stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Analyze,
    Compile,
    Relocate,
    Generate,
    Execute,
    Validate,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Compile => "compile",
            Self::Relocate => "relocate",
            Self::Generate => "generate",
            Self::Execute => "execute",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one sample task.
///
/// `Success` and `Failed` are terminal: a record carrying either is never
/// mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "status")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed { stage: StageName },
}

impl TaskStatus {
    /// Whether the status is terminal (no further stage invocations).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed { .. } => "FAILED",
        }
    }
}

/// One sample stub from the design plan. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Stable identifier within the plan (e.g., "L1.1", "A3").
    pub id: String,
    /// Concise natural-language description of the sound sample.
    pub seed_description: String,
    /// Requested duration in seconds. Must be positive.
    pub duration_s: f64,
}

/// The design plan: a theme plus an ordered list of sample stubs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub theme: String,
    pub samples: Vec<PlanItem>,
}

/// Structured synthesis recipe produced by the Analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Slug-friendly name for the effect.
    pub effect_name: String,
    /// Target duration in seconds. Must be at least 0.1.
    pub duration: f64,
    /// Natural-language synthesis instructions.
    pub description: String,
}

/// Intermediate payload handed from the Compile stage to Relocate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutput {
    /// Path of the rendered (not yet relocated) audio file.
    pub artifact_path: String,
    /// Effect name carried from the recipe, used for the final filename.
    pub effect_name: String,
}

/// A finalized artifact: its resting place plus an integrity checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// SHA-256 of the file contents, lowercase hex.
    pub checksum: String,
}

/// The full record of one sample task's journey through the pipeline.
///
/// Owned exclusively by the runner driving the task until a terminal
/// status is reached; afterwards it is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Position in the plan (0-indexed).
    pub index: usize,
    pub item: PlanItem,
    /// Per-stage payloads from the final attempt. An entry is `Some` only
    /// if that stage succeeded in the attempt the record settled on;
    /// outputs are discarded whenever the pipeline restarts.
    pub stage_outputs: Vec<Option<String>>,
    pub artifact: Option<ArtifactRef>,
    #[serde(flatten)]
    pub status: TaskStatus,
    /// Number of full pipeline cycles started (1-indexed).
    pub attempts: u32,
    /// Every failure message across all attempts, in order. Kept even
    /// after success as an audit trail of transient faults.
    pub error_log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a fresh record for a task that is about to run.
    pub fn new(index: usize, item: PlanItem) -> Self {
        Self {
            index,
            item,
            stage_outputs: Vec::new(),
            artifact: None,
            status: TaskStatus::Running,
            attempts: 0,
            error_log: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Shared state for one run. Mutated only through synchronized access
/// owned by the run controller; `completed` is written exactly once,
/// after the manifest write has been confirmed.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub id: RunId,
    pub theme: String,
    pub out_dir: PathBuf,
    pub tasks: Vec<TaskRecord>,
    pub run_errors: Vec<String>,
    pub completed: bool,
}

impl RunState {
    pub fn new(id: RunId, theme: impl Into<String>, out_dir: PathBuf) -> Self {
        Self {
            id,
            theme: theme.into(),
            out_dir,
            tasks: Vec::new(),
            run_errors: Vec::new(),
            completed: false,
        }
    }
}
