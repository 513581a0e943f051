//! The stage seam: one named step with its own success/failure contract.
//!
//! A stage wraps exactly one external collaborator call (or one local
//! filesystem operation). The pipeline driver only ever sees the
//! `StageOutcome` sum type; raw output sniffing lives in
//! `soundpipe_core::classify`.

use std::future::Future;
use std::pin::Pin;

use soundpipe_core::StageName;
use tokio_util::sync::CancellationToken;

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage produced a payload; it becomes the next stage's input.
    Success(String),
    /// Transient fault. The whole pipeline restarts from its first stage,
    /// consuming one unit of the attempt budget.
    Retryable { message: String },
    /// Transient fault attributed to an earlier stage (the relocation
    /// "source missing" case). Restarts like `Retryable`, but budget
    /// exhaustion is charged to `stage`.
    RetryableUpstream { stage: StageName, message: String },
    /// The operation is structurally impossible to retry; the task ends
    /// immediately regardless of remaining budget.
    Terminal { message: String },
    /// The run was cancelled while this stage was in flight.
    Cancelled,
}

/// Boxed future so stage lists can be held as trait objects.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = StageOutcome> + Send + 'a>>;

/// One named step in a task's pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Invoke the stage on the current pipeline payload.
    ///
    /// Implementations must honor `cancel` cooperatively: an in-flight
    /// collaborator call is killed and `StageOutcome::Cancelled` returned.
    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a>;
}
