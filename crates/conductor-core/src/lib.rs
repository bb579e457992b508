//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the workflow state machine, the fixed step templates, the persisted
//! record types, and the unified error enum.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Workflow`] / [`WorkflowStatus`] — A workflow run and its lifecycle.
//! - [`WorkflowType`] — The fixed set of step templates.
//! - [`Step`], [`Alert`], [`ProviderHealth`] — Persisted child records.
//! - [`ProgressEvent`] — One entry of a workflow's progress stream.
//! - [`ParamValue`] — Typed value for parameters and results.

/// Error types.
pub mod error;
/// Fixed workflow templates.
pub mod template;
/// Step, alert, provider-health, progress and control records.
pub mod types;
/// Typed parameter and result values.
pub mod value;
/// Workflow record and state machine.
pub mod workflow;

pub use error::{ConductorError, ConductorResult};
pub use template::{StepTemplate, WorkflowType};
pub use types::{
    Alert, AlertSeverity, AlertType, ControlRequest, ProgressEvent, ProviderHealth, Step,
    StepStatus, MAX_HEALTH,
};
pub use value::{ParamValue, Parameters};
pub use workflow::{NewWorkflow, Workflow, WorkflowStatus};
