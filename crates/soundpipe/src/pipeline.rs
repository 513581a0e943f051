//! Bounded-retry pipeline driver.
//!
//! Runs an ordered stage list under a shared attempt budget with
//! full-cycle restart: a retryable failure at any stage abandons the
//! attempt and restarts from the FIRST stage, because a late failure may
//! be caused by a bad upstream payload and the upstream collaborators are
//! non-deterministic. A terminal failure ends the task immediately,
//! regardless of remaining budget.
//!
//! The driver is generic over its stage list and is instantiated at two
//! granularities: the per-sample pipeline (analyze/compile/relocate) and
//! the compile-internal pipeline (generate/execute/validate). The inner
//! instantiation is a single stage from the outer one's point of view;
//! its retries are invisible to, and do not consume, the outer budget.

use soundpipe_core::StageName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stage::{Stage, StageOutcome};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Every stage succeeded in one cycle; carries the final payload.
    Success { payload: String },
    /// Terminal failure, or the attempt budget ran out. `stage` is the
    /// stage the failure is attributed to (which, for a relocation
    /// "source missing" fault, is the compile stage).
    Failed { stage: StageName },
    /// The run was cancelled mid-flight.
    Cancelled,
}

/// Everything the caller needs to build a task record.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    /// Full pipeline cycles started (1-indexed). Never exceeds the budget.
    pub attempts: u32,
    /// Every failure message across all attempts, in order.
    pub error_log: Vec<String>,
    /// Per-stage payloads from the final cycle. `Some` only for stages
    /// that succeeded in that cycle; earlier cycles' outputs are
    /// discarded on restart.
    pub stage_outputs: Vec<Option<String>>,
}

/// Generic bounded-retry driver over an ordered stage list.
#[derive(Debug, Clone, Copy)]
pub struct PipelineEngine {
    max_attempts: u32,
}

impl PipelineEngine {
    /// `max_attempts` is the total number of full cycles allowed
    /// (1 initial + retries). A budget of 0 is clamped to 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive `stages` to a terminal outcome.
    pub async fn run(
        &self,
        stages: &[Box<dyn Stage>],
        initial_input: &str,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut attempts: u32 = 0;
        let mut error_log: Vec<String> = Vec::new();
        // Stage the next budget exhaustion would be attributed to.
        let mut last_failed: Option<StageName> = None;

        loop {
            attempts += 1;
            let mut state = initial_input.to_string();
            let mut outputs: Vec<Option<String>> = vec![None; stages.len()];
            let mut restart = false;

            for (idx, stage) in stages.iter().enumerate() {
                if cancel.is_cancelled() {
                    return PipelineOutcome {
                        status: PipelineStatus::Cancelled,
                        attempts,
                        error_log,
                        stage_outputs: outputs,
                    };
                }

                debug!(stage = %stage.name(), attempt = attempts, "invoking stage");

                match stage.invoke(&state, cancel).await {
                    StageOutcome::Success(payload) => {
                        outputs[idx] = Some(payload.clone());
                        state = payload;
                    }
                    StageOutcome::Retryable { message } => {
                        warn!(
                            stage = %stage.name(),
                            attempt = attempts,
                            message = %message,
                            "retryable stage failure"
                        );
                        error_log.push(format!(
                            "attempt {attempts}: {}: {message}",
                            stage.name()
                        ));
                        last_failed = Some(stage.name());
                        restart = true;
                        break;
                    }
                    StageOutcome::RetryableUpstream { stage: upstream, message } => {
                        warn!(
                            stage = %stage.name(),
                            attributed_to = %upstream,
                            attempt = attempts,
                            message = %message,
                            "retryable stage failure attributed upstream"
                        );
                        error_log.push(format!(
                            "attempt {attempts}: {} (attributed to {upstream}): {message}",
                            stage.name()
                        ));
                        last_failed = Some(upstream);
                        restart = true;
                        break;
                    }
                    StageOutcome::Terminal { message } => {
                        warn!(
                            stage = %stage.name(),
                            attempt = attempts,
                            message = %message,
                            "terminal stage failure"
                        );
                        error_log.push(format!(
                            "attempt {attempts}: {}: terminal: {message}",
                            stage.name()
                        ));
                        return PipelineOutcome {
                            status: PipelineStatus::Failed {
                                stage: stage.name(),
                            },
                            attempts,
                            error_log,
                            stage_outputs: outputs,
                        };
                    }
                    StageOutcome::Cancelled => {
                        return PipelineOutcome {
                            status: PipelineStatus::Cancelled,
                            attempts,
                            error_log,
                            stage_outputs: outputs,
                        };
                    }
                }
            }

            if !restart {
                return PipelineOutcome {
                    status: PipelineStatus::Success { payload: state },
                    attempts,
                    error_log,
                    stage_outputs: outputs,
                };
            }

            if attempts >= self.max_attempts {
                let stage = last_failed.unwrap_or_else(|| stages[0].name());
                error_log.push(format!(
                    "attempt budget exhausted after {attempts} attempts at {stage}"
                ));
                return PipelineOutcome {
                    status: PipelineStatus::Failed { stage },
                    attempts,
                    error_log,
                    // Outputs from the failed cycle are partial; discard
                    // them as the restart would have.
                    stage_outputs: vec![None; stages.len()],
                };
            }
        }
    }
}
