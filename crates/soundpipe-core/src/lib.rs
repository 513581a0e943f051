pub mod classify;
pub mod config;
pub mod naming;
pub mod plan;
pub mod report;
pub mod types;

pub use config::Config;
pub use report::{Manifest, ReportError};
pub use types::*;
