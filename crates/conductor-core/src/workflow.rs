use crate::error::{ConductorError, ConductorResult};
use crate::template::{StepTemplate, WorkflowType};
use crate::value::{ParamValue, Parameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a workflow.
///
/// ```text
/// PENDING → RUNNING → {PAUSED ↔ RUNNING} → {COMPLETED | FAILED | CANCELLED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, not yet claimed by a runner.
    Pending,
    /// A runner is executing steps.
    Running,
    /// Suspended at a step boundary.
    Paused,
    /// All steps succeeded.
    Completed,
    /// A step failed; remaining steps were not run.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl WorkflowStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [WorkflowStatus; 6] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Whether `self → to` is an edge of the workflow state graph.
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    /// Persisted text form.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        // Older records spell it the American way.
        let normalized = if normalized == "canceled" {
            "cancelled".to_string()
        } else {
            normalized
        };
        WorkflowStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| ConductorError::Validation(format!("unknown workflow status: {s}")))
    }
}

/// Caller-supplied description of a workflow to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    /// Template to run.
    pub workflow_type: WorkflowType,
    /// The request text driving the workflow (e.g. "Build X").
    pub request: String,
    /// Optional project the workflow belongs to.
    pub project: Option<String>,
    /// Extra typed parameters passed to every step.
    pub parameters: Parameters,
}

impl NewWorkflow {
    /// Describe a workflow of `workflow_type` for `request`.
    pub fn new(workflow_type: WorkflowType, request: impl Into<String>) -> Self {
        Self {
            workflow_type,
            request: request.into(),
            project: None,
            parameters: Parameters::new(),
        }
    }

    /// Attach the workflow to a project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Add a typed parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// One orchestrated run of a fixed step template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub project: Option<String>,
    pub request: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// 1-based number of the step most recently started; 0 before the first.
    pub current_step: u32,
    pub total_steps: u32,
    /// 0–100, non-decreasing within a run.
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub result: Option<ParamValue>,
}

impl Workflow {
    /// Create a PENDING workflow from a caller description.
    pub fn new(spec: NewWorkflow) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_type: spec.workflow_type,
            status: WorkflowStatus::Pending,
            project: spec.project,
            request: spec.request,
            parameters: spec.parameters,
            current_step: 0,
            total_steps: spec.workflow_type.total_steps(),
            progress_percent: 0,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            error: None,
            result: None,
        }
    }

    /// The template step list.
    pub fn steps(&self) -> &'static [StepTemplate] {
        self.workflow_type.steps()
    }

    /// Whether the workflow has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, stamping the matching timestamp.
    ///
    /// Edges outside the state graph are rejected and leave the record untouched.
    pub fn transition(&mut self, to: WorkflowStatus) -> ConductorResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(ConductorError::invalid_transition(self.status, to));
        }
        let now = Utc::now();
        match to {
            WorkflowStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            WorkflowStatus::Paused => self.paused_at = Some(now),
            WorkflowStatus::Completed => {
                self.completed_at = Some(now);
                self.progress_percent = 100;
            }
            WorkflowStatus::Failed => self.failed_at = Some(now),
            WorkflowStatus::Cancelled => self.cancelled_at = Some(now),
            WorkflowStatus::Pending => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record `completed` finished steps, never moving progress backwards.
    pub fn record_progress(&mut self, completed: u32) {
        let pct = if self.total_steps == 0 {
            100
        } else {
            (completed.min(self.total_steps) * 100 / self.total_steps) as u8
        };
        self.progress_percent = self.progress_percent.max(pct);
        self.updated_at = Utc::now();
    }

    /// Check structural invariants before the record is persisted.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.request.trim().is_empty() {
            return Err(ConductorError::Validation(format!(
                "workflow {} has an empty request",
                self.id
            )));
        }
        if self.progress_percent > 100 {
            return Err(ConductorError::Validation(format!(
                "workflow {} progress {} exceeds 100",
                self.id, self.progress_percent
            )));
        }
        if self.total_steps != self.workflow_type.total_steps() {
            return Err(ConductorError::Validation(format!(
                "workflow {} declares {} steps but template {} has {}",
                self.id,
                self.total_steps,
                self.workflow_type,
                self.workflow_type.total_steps()
            )));
        }
        if self.current_step > self.total_steps {
            return Err(ConductorError::Validation(format!(
                "workflow {} current step {} beyond total {}",
                self.id, self.current_step, self.total_steps
            )));
        }
        Ok(())
    }
}
