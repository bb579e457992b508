use crate::error::ConductorError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One step of a fixed workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTemplate {
    /// Stable key used to address this step's result (e.g. `plan`).
    pub key: &'static str,
    /// Human-readable title recorded on the step.
    pub title: &'static str,
    /// Agent the step is dispatched to.
    pub agent_id: &'static str,
    /// Action the agent performs.
    pub action: &'static str,
}

const DELIVERY_PIPELINE: &[StepTemplate] = &[
    StepTemplate {
        key: "plan",
        title: "Plan the delivery",
        agent_id: "planner",
        action: "plan",
    },
    StepTemplate {
        key: "execute",
        title: "Implement the plan",
        agent_id: "coder",
        action: "execute",
    },
    StepTemplate {
        key: "qa",
        title: "Quality assurance",
        agent_id: "qa",
        action: "qa",
    },
    StepTemplate {
        key: "report",
        title: "Delivery report",
        agent_id: "reporter",
        action: "report",
    },
];

const CODE_REVIEW: &[StepTemplate] = &[
    StepTemplate {
        key: "analyze",
        title: "Analyze the change",
        agent_id: "analyst",
        action: "analyze",
    },
    StepTemplate {
        key: "review",
        title: "Review the change",
        agent_id: "reviewer",
        action: "review",
    },
    StepTemplate {
        key: "report",
        title: "Review report",
        agent_id: "reporter",
        action: "report",
    },
];

const SECURITY_AUDIT: &[StepTemplate] = &[
    StepTemplate {
        key: "scan",
        title: "Scan for vulnerabilities",
        agent_id: "security",
        action: "scan",
    },
    StepTemplate {
        key: "triage",
        title: "Triage findings",
        agent_id: "analyst",
        action: "triage",
    },
    StepTemplate {
        key: "remediate",
        title: "Propose remediations",
        agent_id: "coder",
        action: "remediate",
    },
    StepTemplate {
        key: "report",
        title: "Audit report",
        agent_id: "reporter",
        action: "report",
    },
];

const BUG_FIX: &[StepTemplate] = &[
    StepTemplate {
        key: "reproduce",
        title: "Reproduce the defect",
        agent_id: "qa",
        action: "reproduce",
    },
    StepTemplate {
        key: "fix",
        title: "Fix the defect",
        agent_id: "coder",
        action: "fix",
    },
    StepTemplate {
        key: "verify",
        title: "Verify the fix",
        agent_id: "qa",
        action: "verify",
    },
    StepTemplate {
        key: "report",
        title: "Fix report",
        agent_id: "reporter",
        action: "report",
    },
];

/// The fixed set of workflow templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// plan → execute → qa → report
    DeliveryPipeline,
    /// analyze → review → report
    CodeReview,
    /// scan → triage → remediate → report
    SecurityAudit,
    /// reproduce → fix → verify → report
    BugFix,
}

impl WorkflowType {
    /// Every template, in declaration order.
    pub const ALL: [WorkflowType; 4] = [
        WorkflowType::DeliveryPipeline,
        WorkflowType::CodeReview,
        WorkflowType::SecurityAudit,
        WorkflowType::BugFix,
    ];

    /// The ordered step list for this template.
    pub fn steps(self) -> &'static [StepTemplate] {
        match self {
            WorkflowType::DeliveryPipeline => DELIVERY_PIPELINE,
            WorkflowType::CodeReview => CODE_REVIEW,
            WorkflowType::SecurityAudit => SECURITY_AUDIT,
            WorkflowType::BugFix => BUG_FIX,
        }
    }

    /// Number of steps in this template.
    pub fn total_steps(self) -> u32 {
        self.steps().len() as u32
    }

    /// Persisted text form.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::DeliveryPipeline => "delivery_pipeline",
            WorkflowType::CodeReview => "code_review",
            WorkflowType::SecurityAudit => "security_audit",
            WorkflowType::BugFix => "bug_fix",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        WorkflowType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ConductorError::Validation(format!("unknown workflow type: {s}")))
    }
}
