//! Durable storage for workflows, steps, alerts and provider health.
//!
//! Every save is an upsert keyed by the record's unique id (or
//! `(workflow_id, step_number)` for steps), so retried code paths never
//! duplicate rows and never discard child rows tied to a workflow.
//!
//! # Main types
//!
//! - [`WorkflowStore`] — Workflow/step/alert persistence and query surface.
//! - [`HealthStore`] — Provider health persistence used by the router.
//! - [`SqliteWorkflowStore`] — SQLite implementation with legacy-cache migration.
//! - [`MemoryWorkflowStore`] — In-memory implementation with the same semantics.

/// In-memory store.
pub mod memory;
/// One-time migration from the legacy JSON key-value cache.
pub mod migration;
/// SQLite store.
pub mod sqlite;

pub use memory::MemoryWorkflowStore;
pub use migration::MigrationReport;
pub use sqlite::SqliteWorkflowStore;

use async_trait::async_trait;
use conductor_core::{
    Alert, ConductorResult, ControlRequest, ProviderHealth, Step, Workflow, WorkflowStatus,
};
use std::time::Duration;
use uuid::Uuid;

/// Persistence and query surface for workflow records.
///
/// Each call is its own transaction; implementations hold no lock across calls.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or update a workflow by id. Child steps and alerts are kept.
    ///
    /// A terminal record is read-only: saving it again with a different
    /// status fails with `InvalidTransition` and leaves the stored row as is.
    async fn save_workflow(&self, workflow: &Workflow) -> ConductorResult<()>;

    /// Fetch a workflow by id.
    async fn get_workflow(&self, id: Uuid) -> ConductorResult<Option<Workflow>>;

    /// All non-terminal workflows, oldest first.
    async fn list_active(&self) -> ConductorResult<Vec<Workflow>>;

    /// Terminal workflows, newest first. `page` is zero-based.
    async fn list_history(&self, page: u32, page_size: u32) -> ConductorResult<Vec<Workflow>>;

    /// Workflows in `status`, oldest first.
    async fn list_by_status(&self, status: WorkflowStatus) -> ConductorResult<Vec<Workflow>>;

    /// Insert or update a step keyed by `(workflow_id, step_number)`.
    async fn save_step(&self, step: &Step) -> ConductorResult<()>;

    /// Steps of a workflow ordered by step number.
    async fn list_steps(&self, workflow_id: Uuid) -> ConductorResult<Vec<Step>>;

    /// Insert or update an alert by id.
    async fn save_alert(&self, alert: &Alert) -> ConductorResult<()>;

    /// Most recent alerts first, optionally for one workflow.
    async fn list_alerts(&self, workflow_id: Option<Uuid>, limit: usize)
        -> ConductorResult<Vec<Alert>>;

    /// Persist a control request for whichever process owns the runner. Latest wins.
    async fn request_control(&self, workflow_id: Uuid, request: ControlRequest)
        -> ConductorResult<()>;

    /// Remove and return the pending control request, if any.
    async fn take_control(&self, workflow_id: Uuid) -> ConductorResult<Option<ControlRequest>>;

    /// Take the runner lease on a workflow for `runner_id`.
    ///
    /// Succeeds when nobody holds the lease, when `runner_id` already holds
    /// it, or when the holder has not renewed it within `lease`. Returns
    /// `false` while another runner's lease is live.
    async fn claim_runner(
        &self,
        workflow_id: Uuid,
        runner_id: Uuid,
        lease: Duration,
    ) -> ConductorResult<bool>;

    /// Refresh the lease heartbeat. `false` means `runner_id` no longer holds it.
    async fn renew_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<bool>;

    /// Drop the lease if `runner_id` still holds it.
    async fn release_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<()>;
}

/// Persistence for provider health scores.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Every persisted provider health record.
    async fn load_health(&self) -> ConductorResult<Vec<ProviderHealth>>;

    /// Insert or update one provider's record. A record older than the
    /// stored one (by `updated_at`) is ignored.
    async fn save_health(&self, health: &ProviderHealth) -> ConductorResult<()>;

    /// Record a provider-level alert.
    async fn record_alert(&self, alert: &Alert) -> ConductorResult<()>;
}
