use crate::error::ConductorError;
use crate::value::ParamValue;
use crate::workflow::{Workflow, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Implements `as_str`, `Display` and a case-insensitive `FromStr` for a
/// unit-only enum whose persisted form is a fixed lowercase string.
macro_rules! text_enum {
    ($ty:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Persisted text form.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ConductorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(ConductorError::Validation(format!(
                        concat!("unknown ", $label, ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

/// Status of a single step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(StepStatus, "step status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// A single unit of work within a workflow. Unique on `(workflow_id, step_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub workflow_id: Uuid,
    /// 1-based position in the template.
    pub step_number: u32,
    pub title: String,
    pub agent_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<ParamValue>,
    pub error: Option<String>,
}

impl Step {
    /// A step that has just been dispatched.
    pub fn started(
        workflow_id: Uuid,
        step_number: u32,
        title: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            step_number,
            title: title.into(),
            agent_id: agent_id.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Mark the step finished successfully.
    pub fn complete(&mut self, result: ParamValue, duration_ms: u64) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.result = Some(result);
        self.error = None;
    }

    /// Mark the step failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.error = Some(error.into());
    }

    /// Mark the step interrupted by cancellation.
    pub fn cancel(&mut self) {
        self.status = StepStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    WorkflowFailed,
    WorkflowCancelled,
    ProviderQuarantined,
    ProviderExhausted,
    PersistenceFailure,
}

text_enum!(AlertType, "alert type", {
    WorkflowFailed => "workflow_failed",
    WorkflowCancelled => "workflow_cancelled",
    ProviderQuarantined => "provider_quarantined",
    ProviderExhausted => "provider_exhausted",
    PersistenceFailure => "persistence_failure",
});

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

text_enum!(AlertSeverity, "alert severity", {
    Info => "info",
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});

/// An operator-facing notification, optionally tied to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub workflow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Create an alert stamped now.
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            workflow_id: None,
            created_at: Utc::now(),
        }
    }

    /// Tie the alert to a workflow.
    pub fn for_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// Highest possible health score.
pub const MAX_HEALTH: u8 = 100;

/// Rolling reliability record for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    /// 0–100.
    pub score: u8,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderHealth {
    /// A provider with a perfect score.
    pub fn healthy(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            score: MAX_HEALTH,
            quarantine_until: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the quarantine window still covers `now`.
    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        self.quarantine_until.is_some_and(|until| until > now)
    }

    /// Apply a signed score delta, clamped to 0–100.
    pub fn adjust(&mut self, delta: i16) {
        let next = (i16::from(self.score) + delta).clamp(0, i16::from(MAX_HEALTH));
        self.score = next as u8;
        self.updated_at = Utc::now();
    }
}

/// One entry of a workflow's progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub progress_percent: u8,
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
}

impl ProgressEvent {
    /// Snapshot the workflow's current position with a message.
    pub fn from_workflow(workflow: &Workflow, message: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow.id,
            status: workflow.status,
            progress_percent: workflow.progress_percent,
            current_step: workflow.current_step,
            total_steps: workflow.total_steps,
            message: message.into(),
        }
    }
}

/// A control request persisted for the process that owns a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRequest {
    Pause,
    Resume,
    Cancel,
}

text_enum!(ControlRequest, "control request", {
    Pause => "pause",
    Resume => "resume",
    Cancel => "cancel",
});

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::template::WorkflowType;
    use crate::workflow::NewWorkflow;
    use chrono::Duration;

    #[test]
    fn test_health_adjust_is_clamped() {
        let mut h = ProviderHealth::healthy("a");
        h.adjust(5);
        assert_eq!(h.score, 100);
        h.adjust(-15);
        assert_eq!(h.score, 85);
        for _ in 0..10 {
            h.adjust(-15);
        }
        assert_eq!(h.score, 0);
    }

    #[test]
    fn test_quarantine_window() {
        let now = Utc::now();
        let mut h = ProviderHealth::healthy("a");
        assert!(!h.is_quarantined(now));
        h.quarantine_until = Some(now + Duration::seconds(30));
        assert!(h.is_quarantined(now));
        assert!(!h.is_quarantined(now + Duration::seconds(31)));
    }

    #[test]
    fn test_step_lifecycle() {
        let id = Uuid::new_v4();
        let mut step = Step::started(id, 1, "Plan", "planner");
        assert_eq!(step.status, StepStatus::Running);
        step.complete(ParamValue::Text("done".into()), 12);
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.duration_ms, Some(12));
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn test_progress_event_wire_names() {
        let wf = Workflow::new(NewWorkflow::new(WorkflowType::CodeReview, "Review PR"));
        let event = ProgressEvent::from_workflow(&wf, "created");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("workflowId").is_some());
        assert!(json.get("progressPercent").is_some());
        assert_eq!(json["totalSteps"], 3);
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_text_enums_round_trip_through_str() {
        assert_eq!(
            "PROVIDER_QUARANTINED".parse::<AlertType>().unwrap(),
            AlertType::ProviderQuarantined
        );
        assert_eq!(AlertSeverity::Critical.to_string(), "critical");
        assert!(AlertSeverity::Warning < AlertSeverity::Error);
        assert!("later".parse::<ControlRequest>().is_err());
    }
}
