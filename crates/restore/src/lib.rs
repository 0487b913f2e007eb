//! Restore orchestration: preflight, command composition, supervised
//! execution of the restore tool and milestone extraction from its output.

pub mod command;
pub mod orchestrator;
pub mod steps;
mod supervise;

pub use command::{compose_command, restore_log_path, sanitize_udid};
pub use orchestrator::{RestoreOrchestrator, RestoreParams, RestoreSettings, OPEN_LOG_STEP};
pub use steps::{default_patterns, load_patterns, StepExtractor, StepPattern, StepPatternError, StepTable};
