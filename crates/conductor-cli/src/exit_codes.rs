//! Stable exit codes for `conductor` commands.

use conductor_core::{ConductorError, WorkflowStatus};

/// Command succeeded, or the workflow completed.
pub const OK: u8 = 0;
/// The workflow finished FAILED.
pub const FAILED: u8 = 1;
/// The workflow finished CANCELLED.
pub const CANCELLED: u8 = 2;
/// Bad arguments, bad configuration, or a request the workflow's state does not allow.
pub const USAGE: u8 = 3;
/// No workflow with the given id.
pub const NOT_FOUND: u8 = 4;
/// Storage or other internal failure.
pub const INTERNAL: u8 = 5;

/// Exit code for a workflow that a command ran to the end.
pub fn for_status(status: WorkflowStatus) -> u8 {
    match status {
        WorkflowStatus::Failed => FAILED,
        WorkflowStatus::Cancelled => CANCELLED,
        _ => OK,
    }
}

/// Exit code for an error that aborted a command.
pub fn for_error(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ConductorError>() {
        Some(ConductorError::WorkflowNotFound(_)) => NOT_FOUND,
        Some(
            ConductorError::Config(_)
            | ConductorError::Validation(_)
            | ConductorError::InvalidTransition { .. }
            | ConductorError::AlreadyRunning(_)
            | ConductorError::NotRunning(_),
        ) => USAGE,
        Some(ConductorError::Cancelled) => CANCELLED,
        _ => INTERNAL,
    }
}
