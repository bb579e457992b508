use crate::{HealthStore, WorkflowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    Alert, ConductorError, ConductorResult, ControlRequest, ProviderHealth, Step, Workflow,
    WorkflowStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, Workflow>,
    steps: HashMap<(Uuid, u32), Step>,
    alerts: HashMap<Uuid, Alert>,
    health: HashMap<String, ProviderHealth>,
    control: HashMap<Uuid, ControlRequest>,
    leases: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
}

/// In-memory store with the same upsert and ordering semantics as the SQLite store.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryWorkflowStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryWorkflowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(mut workflows: Vec<Workflow>) -> Vec<Workflow> {
    workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    workflows
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save_workflow(&self, workflow: &Workflow) -> ConductorResult<()> {
        workflow.validate()?;
        let mut tables = self.tables.write().await;
        if let Some(stored) = tables.workflows.get(&workflow.id) {
            if stored.is_terminal() && stored.status != workflow.status {
                return Err(ConductorError::invalid_transition(
                    stored.status,
                    workflow.status,
                ));
            }
        }
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> ConductorResult<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(&id).cloned())
    }

    async fn list_active(&self) -> ConductorResult<Vec<Workflow>> {
        let tables = self.tables.read().await;
        Ok(oldest_first(
            tables
                .workflows
                .values()
                .filter(|wf| !wf.is_terminal())
                .cloned()
                .collect(),
        ))
    }

    async fn list_history(&self, page: u32, page_size: u32) -> ConductorResult<Vec<Workflow>> {
        let tables = self.tables.read().await;
        let mut done: Vec<Workflow> = tables
            .workflows
            .values()
            .filter(|wf| wf.is_terminal())
            .cloned()
            .collect();
        done.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        let skip = (page as usize).saturating_mul(page_size as usize);
        Ok(done.into_iter().skip(skip).take(page_size as usize).collect())
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> ConductorResult<Vec<Workflow>> {
        let tables = self.tables.read().await;
        Ok(oldest_first(
            tables
                .workflows
                .values()
                .filter(|wf| wf.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn save_step(&self, step: &Step) -> ConductorResult<()> {
        if step.step_number == 0 {
            return Err(ConductorError::Validation(format!(
                "step numbers are 1-based (workflow {})",
                step.workflow_id
            )));
        }
        let mut tables = self.tables.write().await;
        if !tables.workflows.contains_key(&step.workflow_id) {
            return Err(ConductorError::Persistence(format!(
                "step {} references unknown workflow {}",
                step.step_number, step.workflow_id
            )));
        }
        tables
            .steps
            .insert((step.workflow_id, step.step_number), step.clone());
        Ok(())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> ConductorResult<Vec<Step>> {
        let tables = self.tables.read().await;
        let mut steps: Vec<Step> = tables
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn save_alert(&self, alert: &Alert) -> ConductorResult<()> {
        let mut tables = self.tables.write().await;
        tables.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn list_alerts(
        &self,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> ConductorResult<Vec<Alert>> {
        let tables = self.tables.read().await;
        let mut alerts: Vec<Alert> = tables
            .alerts
            .values()
            .filter(|a| workflow_id.is_none() || a.workflow_id == workflow_id)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn request_control(
        &self,
        workflow_id: Uuid,
        request: ControlRequest,
    ) -> ConductorResult<()> {
        self.tables.write().await.control.insert(workflow_id, request);
        Ok(())
    }

    async fn take_control(&self, workflow_id: Uuid) -> ConductorResult<Option<ControlRequest>> {
        Ok(self.tables.write().await.control.remove(&workflow_id))
    }

    async fn claim_runner(
        &self,
        workflow_id: Uuid,
        runner_id: Uuid,
        lease: Duration,
    ) -> ConductorResult<bool> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| ConductorError::Validation(format!("runner lease out of range: {e}")))?;
        let mut tables = self.tables.write().await;
        if !tables.workflows.contains_key(&workflow_id) {
            return Err(ConductorError::Persistence(format!(
                "lease references unknown workflow {workflow_id}"
            )));
        }
        let now = Utc::now();
        let free = match tables.leases.get(&workflow_id) {
            Some((holder, heartbeat_at)) => *holder == runner_id || *heartbeat_at < now - lease,
            None => true,
        };
        if free {
            tables.leases.insert(workflow_id, (runner_id, now));
        }
        Ok(free)
    }

    async fn renew_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.leases.get_mut(&workflow_id) {
            Some((holder, heartbeat_at)) if *holder == runner_id => {
                *heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<()> {
        let mut tables = self.tables.write().await;
        if matches!(tables.leases.get(&workflow_id), Some((holder, _)) if *holder == runner_id) {
            tables.leases.remove(&workflow_id);
        }
        Ok(())
    }
}

#[async_trait]
impl HealthStore for MemoryWorkflowStore {
    async fn load_health(&self) -> ConductorResult<Vec<ProviderHealth>> {
        let tables = self.tables.read().await;
        let mut all: Vec<ProviderHealth> = tables.health.values().cloned().collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(all)
    }

    async fn save_health(&self, health: &ProviderHealth) -> ConductorResult<()> {
        let mut tables = self.tables.write().await;
        let stale = tables
            .health
            .get(&health.provider_id)
            .is_some_and(|stored| stored.updated_at > health.updated_at);
        if !stale {
            tables
                .health
                .insert(health.provider_id.clone(), health.clone());
        }
        Ok(())
    }

    async fn record_alert(&self, alert: &Alert) -> ConductorResult<()> {
        self.save_alert(alert).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{AlertSeverity, AlertType, NewWorkflow, ParamValue, WorkflowType};

    fn workflow() -> Workflow {
        Workflow::new(NewWorkflow::new(WorkflowType::DeliveryPipeline, "Build X"))
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = MemoryWorkflowStore::new();
        let mut wf = workflow();
        store.save_workflow(&wf).await.unwrap();
        wf.transition(WorkflowStatus::Running).unwrap();
        store.save_workflow(&wf).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_finished_workflow_rejects_stale_save() {
        let store = MemoryWorkflowStore::new();
        let mut wf = workflow();
        wf.transition(WorkflowStatus::Running).unwrap();
        store.save_workflow(&wf).await.unwrap();
        let stale = wf.clone();

        wf.transition(WorkflowStatus::Cancelled).unwrap();
        store.save_workflow(&wf).await.unwrap();
        assert!(matches!(
            store.save_workflow(&stale).await,
            Err(ConductorError::InvalidTransition { .. })
        ));
        // Same terminal status again is fine.
        store.save_workflow(&wf).await.unwrap();

        let stored = store.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_runner_lease_is_exclusive_until_it_lapses() {
        let store = MemoryWorkflowStore::new();
        let wf = workflow();
        store.save_workflow(&wf).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = Duration::from_millis(100);

        assert!(store.claim_runner(wf.id, a, lease).await.unwrap());
        assert!(!store.claim_runner(wf.id, b, lease).await.unwrap());
        assert!(store.claim_runner(wf.id, a, lease).await.unwrap());
        assert!(!store.renew_runner(wf.id, b).await.unwrap());
        assert!(store.renew_runner(wf.id, a).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.claim_runner(wf.id, b, lease).await.unwrap());
        assert!(!store.renew_runner(wf.id, a).await.unwrap());

        // Releasing someone else's lease is a no-op.
        store.release_runner(wf.id, a).await.unwrap();
        assert!(!store.claim_runner(wf.id, a, lease).await.unwrap());
        store.release_runner(wf.id, b).await.unwrap();
        assert!(store.claim_runner(wf.id, a, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_older_health_record_is_ignored() {
        let store = MemoryWorkflowStore::new();
        let mut newer = ProviderHealth::healthy("primary");
        newer.adjust(-60);
        let mut older = ProviderHealth::healthy("primary");
        older.updated_at = newer.updated_at - chrono::Duration::seconds(1);

        store.save_health(&newer).await.unwrap();
        store.save_health(&older).await.unwrap();

        let loaded = store.load_health().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].score, 40);
    }

    #[tokio::test]
    async fn test_steps_survive_workflow_resave() {
        let store = MemoryWorkflowStore::new();
        let wf = workflow();
        store.save_workflow(&wf).await.unwrap();

        let mut step = Step::started(wf.id, 1, "Plan", "planner");
        store.save_step(&step).await.unwrap();
        step.complete(ParamValue::Text("plan".into()), 5);
        store.save_step(&step).await.unwrap();
        store.save_workflow(&wf).await.unwrap();

        let steps = store.list_steps(wf.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, conductor_core::StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_orphan_step_rejected() {
        let store = MemoryWorkflowStore::new();
        let step = Step::started(Uuid::new_v4(), 1, "Plan", "planner");
        assert!(matches!(
            store.save_step(&step).await,
            Err(ConductorError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_control_requests_latest_wins() {
        let store = MemoryWorkflowStore::new();
        let id = Uuid::new_v4();
        store.request_control(id, ControlRequest::Pause).await.unwrap();
        store.request_control(id, ControlRequest::Cancel).await.unwrap();
        assert_eq!(
            store.take_control(id).await.unwrap(),
            Some(ControlRequest::Cancel)
        );
        assert_eq!(store.take_control(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_alert_filter_and_limit() {
        let store = MemoryWorkflowStore::new();
        let wf = Uuid::new_v4();
        for _ in 0..3 {
            let alert = Alert::new(AlertType::WorkflowFailed, AlertSeverity::Error, "t", "m")
                .for_workflow(wf);
            store.save_alert(&alert).await.unwrap();
        }
        store
            .record_alert(&Alert::new(
                AlertType::ProviderQuarantined,
                AlertSeverity::Warning,
                "t",
                "m",
            ))
            .await
            .unwrap();

        assert_eq!(store.list_alerts(Some(wf), 10).await.unwrap().len(), 3);
        assert_eq!(store.list_alerts(None, 2).await.unwrap().len(), 2);
        assert_eq!(store.list_alerts(None, 10).await.unwrap().len(), 4);
    }
}
