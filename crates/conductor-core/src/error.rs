use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor engine.
///
/// Each variant corresponds to a subsystem or a caller-visible failure class.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// No workflow with this id exists in the store.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A runner for this workflow id is already active.
    #[error("Workflow already running: {0}")]
    AlreadyRunning(Uuid),

    /// The workflow has no runner in this process.
    #[error("Workflow has no active runner: {0}")]
    NotRunning(Uuid),

    /// A status change outside the workflow state graph.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Status the workflow was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// Cancellation was requested. Not a failure: the workflow ends as CANCELLED.
    #[error("Cancellation requested")]
    Cancelled,

    /// A record failed validation at the store boundary.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The durable store could not read or commit.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A provider-level failure that could not be absorbed by the router.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The agent dispatcher could not carry out a step.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A bounded operation ran past its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Build an [`ConductorError::InvalidTransition`] from any two displayable states.
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the error is the cooperative-cancellation path rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            ConductorError::WorkflowNotFound(id).to_string(),
            format!("Workflow not found: {id}")
        );
        assert_eq!(
            ConductorError::invalid_transition("paused", "completed").to_string(),
            "Invalid transition from paused to completed"
        );
    }

    #[test]
    fn test_cancellation_is_not_a_failure_class() {
        assert!(ConductorError::Cancelled.is_cancellation());
        assert!(!ConductorError::Persistence("disk full".into()).is_cancellation());
    }
}
