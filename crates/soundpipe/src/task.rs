//! Per-sample task execution.
//!
//! Binds one plan item to the outer pipeline (analyze → compile →
//! relocate) and settles it into a `TaskRecord`. Stage failures are
//! resolved here or in the pipeline driver; nothing but the record
//! crosses the runner boundary.

use std::path::Path;

use chrono::Utc;
use soundpipe_core::{plan, ArtifactRef, Config, PlanItem, TaskRecord, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collab::Collaborator;
use crate::pipeline::{PipelineEngine, PipelineStatus};
use crate::stage::Stage;
use crate::stages::{AnalyzeStage, CompileStage, RelocateStage};

/// Build the outer stage list for one sample.
///
/// `require_commands` must have passed on the config before this is
/// called; absent commands fall back to `false`, which fails fast as a
/// retryable stage error rather than panicking.
fn build_stages(config: &Config, item: &PlanItem, out_dir: &Path) -> Vec<Box<dyn Stage>> {
    let timeout = config.stage_timeout_sec;
    let cmd = |c: &Option<String>| c.clone().unwrap_or_else(|| "false".to_string());

    let analyzer = Collaborator::new(cmd(&config.analyzer_cmd), timeout, out_dir);
    let generator = Collaborator::new(cmd(&config.generator_cmd), timeout, out_dir);
    let executor = Collaborator::new(cmd(&config.executor_cmd), timeout, out_dir);
    let validator = config
        .validator_cmd
        .as_ref()
        .map(|c| Collaborator::new(c.clone(), timeout, out_dir));

    vec![
        Box::new(AnalyzeStage::new(analyzer)),
        Box::new(CompileStage::new(
            generator,
            executor,
            validator,
            config.compile_attempts,
        )),
        Box::new(RelocateStage::new(out_dir, item.id.clone())),
    ]
}

/// Run one sample through the full pipeline and settle its record.
pub async fn run_task(
    index: usize,
    item: PlanItem,
    out_dir: &Path,
    config: &Config,
    cancel: &CancellationToken,
) -> TaskRecord {
    let mut record = TaskRecord::new(index, item.clone());
    let stages = build_stages(config, &item, out_dir);
    let engine = PipelineEngine::new(config.task_attempts);

    info!(sample_id = %item.id, index, "task started");

    let initial_input = plan::item_payload(&item);
    let outcome = engine.run(&stages, &initial_input, cancel).await;

    record.attempts = outcome.attempts;
    record.error_log = outcome.error_log;
    record.stage_outputs = outcome.stage_outputs;

    match outcome.status {
        PipelineStatus::Success { payload } => {
            match serde_json::from_str::<ArtifactRef>(&payload) {
                Ok(artifact) => {
                    info!(
                        sample_id = %item.id,
                        attempts = record.attempts,
                        path = %artifact.path.display(),
                        "task succeeded"
                    );
                    record.artifact = Some(artifact);
                    record.status = TaskStatus::Success;
                }
                Err(e) => {
                    // The relocate stage emits the artifact ref itself;
                    // failing to read it back means the pipeline wiring
                    // is broken, not the collaborators.
                    warn!(sample_id = %item.id, error = %e, "unreadable artifact payload");
                    record
                        .error_log
                        .push(format!("unreadable artifact payload: {e}"));
                    record.status = TaskStatus::Failed {
                        stage: soundpipe_core::StageName::Relocate,
                    };
                }
            }
        }
        PipelineStatus::Failed { stage } => {
            warn!(
                sample_id = %item.id,
                stage = %stage,
                attempts = record.attempts,
                "task failed"
            );
            record.status = TaskStatus::Failed { stage };
        }
        PipelineStatus::Cancelled => {
            warn!(sample_id = %item.id, "task cancelled before reaching a terminal status");
            record.error_log.push("cancelled".to_string());
            // Status stays Running: the task never reached a terminal
            // state and the record says so.
        }
    }

    record.ended_at = Some(Utc::now());
    record
}
