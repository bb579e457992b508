use crate::config::ConductorConfig;
use crate::exit_codes;
use anyhow::Context as _;
use async_trait::async_trait;
use conductor_core::{
    ConductorError, NewWorkflow, ParamValue, ProgressEvent, ProviderHealth, Step, Workflow,
    WorkflowStatus, WorkflowType,
};
use conductor_orchestrator::{
    AgentDispatcher, ControlOutcome, InvocationOutcome, RouterDispatcher, WorkflowEngine,
};
use conductor_router::{build_providers, ProviderKind, ProviderRouter};
use conductor_store::{HealthStore, SqliteWorkflowStore, WorkflowStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Open store plus configuration shared by every command.
pub struct Context {
    config: ConductorConfig,
    store: Arc<SqliteWorkflowStore>,
}

impl Context {
    /// Open the database named by `config`, running the legacy migration if due.
    pub async fn open(config: ConductorConfig) -> anyhow::Result<Self> {
        let store = SqliteWorkflowStore::open(config.db_path(), Some(config.legacy_cache_path()))
            .await
            .with_context(|| format!("opening {}", config.db_path().display()))?;
        let report = store.migration_report();
        if report.ran {
            info!(
                workflows = report.workflows,
                steps = report.steps,
                alerts = report.alerts,
                skipped = report.skipped,
                "legacy cache imported"
            );
        }
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    async fn router(&self) -> anyhow::Result<Arc<ProviderRouter>> {
        if self.config.providers.is_empty() {
            return Err(ConductorError::Config(
                "no [[providers]] configured; at least one is needed to run workflows".into(),
            )
            .into());
        }
        let providers =
            build_providers(&self.config.providers, self.config.router.request_timeout())?;
        let router = ProviderRouter::new(providers, self.config.router.clone())?
            .with_health_store(self.store.clone())
            .await?;
        Ok(Arc::new(router))
    }

    /// Engine that can run workflows through the configured providers.
    async fn running_engine(&self) -> anyhow::Result<WorkflowEngine> {
        let dispatcher = Arc::new(RouterDispatcher::new(self.router().await?));
        Ok(WorkflowEngine::new(
            self.store.clone(),
            dispatcher,
            self.config.engine.clone(),
        ))
    }

    /// Engine used only to inspect and control workflows.
    fn control_engine(&self) -> WorkflowEngine {
        WorkflowEngine::new(
            self.store.clone(),
            Arc::new(ControlOnly),
            self.config.engine.clone(),
        )
    }
}

/// Dispatcher for engines that only inspect and control workflows.
struct ControlOnly;

#[async_trait]
impl AgentDispatcher for ControlOnly {
    async fn invoke(&self, agent_id: &str, _action: &str, _params: &Value) -> InvocationOutcome {
        InvocationOutcome::failed(format!("agent {agent_id} is not available in this process"), 0)
    }
}

/// What `start` should run.
pub enum StartTarget {
    New {
        workflow_type: WorkflowType,
        request: String,
        project: Option<String>,
        params: Vec<(String, ParamValue)>,
    },
    Existing(Uuid),
}

/// Create (or pick up) a workflow and run it here, streaming progress.
///
/// The first Ctrl-C cancels the workflow, aborting the runner if it does
/// not stop within the grace period.
pub async fn start(ctx: &Context, target: StartTarget) -> anyhow::Result<u8> {
    let engine = ctx.running_engine().await?;
    let id = match target {
        StartTarget::Existing(id) => id,
        StartTarget::New {
            workflow_type,
            request,
            project,
            params,
        } => {
            let mut spec = NewWorkflow::new(workflow_type, request);
            if let Some(project) = project {
                spec = spec.with_project(project);
            }
            for (key, value) in params {
                spec = spec.with_param(key, value);
            }
            let workflow = engine.create(spec).await?;
            println!("created {} ({})", workflow.id, workflow.workflow_type);
            workflow.id
        }
    };

    let (_, mut progress) = engine.start_observed(id).await?;
    let mut listen = true;
    let mut forced = None;
    loop {
        tokio::select! {
            event = progress.next() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if listen => {
                listen = false;
                match signal {
                    Ok(()) => {
                        eprintln!("interrupted; cancelling workflow {id}");
                        let engine = engine.clone();
                        forced = Some(tokio::spawn(async move { engine.force_cancel(id).await }));
                    }
                    Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
                }
            }
        }
    }
    if let Some(handle) = forced {
        // The run may have finished on its own before the cancel landed.
        if let Err(e) = handle.await? {
            warn!(workflow_id = %id, error = %e, "cancel not applied");
        }
    }

    let done = engine.wait(id).await?;
    println!(
        "workflow {} finished {} at {}%",
        done.id, done.status, done.progress_percent
    );
    if let Some(error) = &done.error {
        eprintln!("error: {error}");
    }
    Ok(exit_codes::for_status(done.status))
}

/// Print a workflow and its steps.
pub async fn status(ctx: &Context, id: Uuid, json: bool) -> anyhow::Result<u8> {
    let engine = ctx.control_engine();
    let workflow = engine.status(id).await?;
    let steps = engine.steps(id).await?;
    if json {
        let doc = serde_json::json!({ "workflow": workflow, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print_workflow(&workflow, &steps);
    }
    Ok(exit_codes::OK)
}

/// Which control request to send.
#[derive(Debug, Clone, Copy)]
pub enum Control {
    Pause,
    Resume,
    Cancel,
}

/// Pause, resume or cancel a workflow.
pub async fn control(ctx: &Context, id: Uuid, request: Control) -> anyhow::Result<u8> {
    let engine = ctx.control_engine();
    let outcome = match request {
        Control::Pause => engine.pause(id).await?,
        Control::Resume => engine.resume(id).await?,
        Control::Cancel => engine.cancel(id).await?,
    };
    let verb = match request {
        Control::Pause => "pause",
        Control::Resume => "resume",
        Control::Cancel => "cancel",
    };
    match outcome {
        ControlOutcome::Applied => println!("{verb} applied to {id}"),
        ControlOutcome::Queued => {
            println!("{verb} queued for {id}; the process running it will apply it shortly")
        }
    }
    Ok(exit_codes::OK)
}

/// List active workflows, or every workflow in `status`.
pub async fn list(ctx: &Context, status: Option<WorkflowStatus>) -> anyhow::Result<u8> {
    let workflows = match status {
        Some(status) => ctx.store.list_by_status(status).await?,
        None => ctx.store.list_active().await?,
    };
    print_table(&workflows);
    Ok(exit_codes::OK)
}

/// Page through finished workflows, newest first. `page` is one-based.
pub async fn history(ctx: &Context, page: u32, page_size: u32) -> anyhow::Result<u8> {
    let workflows = ctx
        .store
        .list_history(page.max(1) - 1, page_size.max(1))
        .await?;
    print_table(&workflows);
    Ok(exit_codes::OK)
}

/// Most recent alerts.
pub async fn alerts(ctx: &Context, workflow: Option<Uuid>, limit: usize) -> anyhow::Result<u8> {
    let alerts = ctx.store.list_alerts(workflow, limit).await?;
    if alerts.is_empty() {
        println!("no alerts");
    }
    for alert in alerts {
        let scope = alert
            .workflow_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8}  {:<20}  {}  {}: {}",
            alert.created_at.format("%Y-%m-%d %H:%M:%S"),
            alert.severity.as_str(),
            alert.alert_type.as_str(),
            scope,
            alert.title,
            alert.message
        );
    }
    Ok(exit_codes::OK)
}

/// Health of every configured provider.
pub async fn providers(ctx: &Context) -> anyhow::Result<u8> {
    let mut persisted: HashMap<String, ProviderHealth> = ctx
        .store
        .load_health()
        .await?
        .into_iter()
        .map(|h| (h.provider_id.clone(), h))
        .collect();
    let now = chrono::Utc::now();

    println!("{:<16}  {:<10}  {:<24}  {:>5}  state", "id", "kind", "model", "score");
    for provider in &ctx.config.providers {
        let health = persisted
            .remove(&provider.id)
            .unwrap_or_else(|| ProviderHealth::healthy(provider.id.clone()));
        let state = match health.quarantine_until {
            Some(until) if until > now => format!("quarantined until {}", until.format("%H:%M:%S")),
            _ if health.score < ctx.config.router.low_health_threshold => "probe only".to_string(),
            _ => "ok".to_string(),
        };
        println!(
            "{:<16}  {:<10}  {:<24}  {:>5}  {state}",
            provider.id,
            kind_name(provider.kind),
            provider.model,
            health.score
        );
    }
    for stale in persisted.values() {
        println!(
            "{:<16}  {:<10}  {:<24}  {:>5}  not configured",
            stale.provider_id, "-", "-", stale.score
        );
    }
    Ok(exit_codes::OK)
}

/// Parse a `key=value` parameter.
pub fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), ParamValue::parse_literal(value)))
}

fn kind_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "openai",
        ProviderKind::Anthropic => "anthropic",
    }
}

fn print_event(event: &ProgressEvent) {
    println!(
        "[{:>3}%] {}/{} {:<9} {}",
        event.progress_percent,
        event.current_step,
        event.total_steps,
        event.status.as_str(),
        event.message
    );
}

fn print_table(workflows: &[Workflow]) {
    if workflows.is_empty() {
        println!("no workflows");
        return;
    }
    println!(
        "{:<36}  {:<18}  {:<9}  {:>4}  {:<19}  request",
        "id", "type", "status", "pct", "updated"
    );
    for wf in workflows {
        println!(
            "{:<36}  {:<18}  {:<9}  {:>3}%  {:<19}  {}",
            wf.id,
            wf.workflow_type.as_str(),
            wf.status.as_str(),
            wf.progress_percent,
            wf.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&wf.request, 48)
        );
    }
}

fn print_workflow(wf: &Workflow, steps: &[Step]) {
    println!("Workflow  {}", wf.id);
    println!("Type      {}", wf.workflow_type);
    println!(
        "Status    {} ({}%, step {}/{})",
        wf.status, wf.progress_percent, wf.current_step, wf.total_steps
    );
    println!("Request   {}", wf.request);
    if let Some(project) = &wf.project {
        println!("Project   {project}");
    }
    println!("Created   {}", wf.created_at.to_rfc3339());
    println!("Updated   {}", wf.updated_at.to_rfc3339());
    if let Some(error) = &wf.error {
        println!("Error     {error}");
    }
    if steps.is_empty() {
        return;
    }
    println!("Steps");
    for step in steps {
        let duration = step
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_default();
        println!(
            "  {:>2}  {:<9}  {:<10}  {:<28}  {}",
            step.step_number,
            step.status.as_str(),
            step.agent_id,
            step.title,
            duration
        );
        if let Some(error) = &step.error {
            println!("      error: {error}");
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_infers_types() {
        assert_eq!(
            parse_param("retries=3").unwrap(),
            ("retries".to_string(), ParamValue::Int(3))
        );
        assert_eq!(
            parse_param("dry_run=true").unwrap().1,
            ParamValue::Bool(true)
        );
        assert_eq!(
            parse_param("branch=feature=x").unwrap().1,
            ParamValue::Text("feature=x".into())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("first line\nsecond", 20), "first line");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
