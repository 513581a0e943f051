//! soundpipe - bounded-retry sample-generation pipeline
//!
//! Library components for the orchestrator binary.

pub mod collab;
pub mod controller;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod task;

pub use controller::{RunController, RunOutcome, RunVerdict};
pub use pipeline::{PipelineEngine, PipelineOutcome, PipelineStatus};
pub use stage::{Stage, StageOutcome};
