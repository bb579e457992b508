use crate::bus::{ProgressBus, ProgressSubscription};
use crate::dispatcher::{AgentDispatcher, InvocationOutcome};
use conductor_core::{
    Alert, AlertSeverity, AlertType, ConductorError, ConductorResult, ControlRequest, NewWorkflow,
    ParamValue, ProgressEvent, Step, StepStatus, StepTemplate, Workflow, WorkflowStatus,
};
use conductor_store::WorkflowStore;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for one agent invocation.
    pub step_timeout_secs: u64,
    /// How long `force_cancel` waits for a cooperative stop before aborting.
    pub cancel_grace_secs: u64,
    /// Interval at which runners poll the store for queued control requests.
    pub control_poll_ms: u64,
    /// Per-subscriber buffer of the progress bus.
    pub bus_capacity: usize,
    /// A runner that has not renewed its lease for this long is presumed dead
    /// and its workflow may be adopted by another process.
    pub runner_lease_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 300,
            cancel_grace_secs: 5,
            control_poll_ms: 500,
            bus_capacity: 256,
            runner_lease_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Step timeout as a duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Cancel grace period as a duration.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Control poll interval as a duration. Never zero.
    pub fn control_poll(&self) -> Duration {
        Duration::from_millis(self.control_poll_ms.max(1))
    }

    /// Runner lease as a duration. Never zero.
    pub fn runner_lease(&self) -> Duration {
        Duration::from_millis(self.runner_lease_ms.max(1))
    }

    /// How often a live runner renews its lease: three times per lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.runner_lease() / 3).max(Duration::from_millis(1))
    }
}

/// How a control request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Delivered to a runner in this process, or applied to the stored record.
    Applied,
    /// Persisted for the process that owns the runner.
    Queued,
}

struct RunnerSlot {
    run_id: Uuid,
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
    done_rx: watch::Receiver<bool>,
    /// Set by `force_cancel` before aborting; the force path then owns the sentinel.
    forced: Arc<AtomicBool>,
}

struct Inner {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    bus: ProgressBus,
    config: EngineConfig,
    runners: Mutex<HashMap<Uuid, RunnerSlot>>,
}

impl Inner {
    async fn raise(&self, alert: Alert) {
        if let Err(e) = self.store.save_alert(&alert).await {
            warn!(alert = %alert.alert_type, error = %e, "failed to record alert");
        }
    }

    async fn release_lease(&self, workflow_id: Uuid, run_id: Uuid) {
        if let Err(e) = self.store.release_runner(workflow_id, run_id).await {
            warn!(workflow_id = %workflow_id, error = %e, "failed to release runner lease");
        }
    }
}

/// Drives workflows through their template steps.
///
/// One runner task per active workflow id. Every transition is persisted
/// and then broadcast on the progress bus, so observers never see a state
/// the store does not also have. The handle is cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

impl WorkflowEngine {
    /// An engine over `store` that runs steps through `dispatcher`.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                bus: ProgressBus::new(config.bus_capacity),
                config,
                runners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Persist a new PENDING workflow.
    pub async fn create(&self, spec: NewWorkflow) -> ConductorResult<Workflow> {
        let workflow = Workflow::new(spec);
        workflow.validate()?;
        self.inner.store.save_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow.workflow_type,
            "workflow created"
        );
        Ok(workflow)
    }

    /// Start running a workflow.
    ///
    /// Accepts PENDING workflows and orphaned RUNNING/PAUSED ones left by a
    /// crashed process. Orphans continue from the first step not completed.
    /// A workflow whose runner lease is still being renewed, here or in
    /// another process, is `AlreadyRunning`. Returns the workflow as
    /// persisted at start.
    pub async fn start(&self, id: Uuid) -> ConductorResult<Workflow> {
        let (workflow, _) = self.launch(id, false).await?;
        Ok(workflow)
    }

    /// Like [`start`](Self::start), with a subscription attached before the
    /// first event so the caller sees the whole run.
    pub async fn start_observed(
        &self,
        id: Uuid,
    ) -> ConductorResult<(Workflow, ProgressSubscription)> {
        let (workflow, subscription) = self.launch(id, true).await?;
        let subscription = subscription.ok_or_else(|| {
            ConductorError::Dispatch(format!("progress channel for {id} closed at start"))
        })?;
        Ok((workflow, subscription))
    }

    async fn launch(
        &self,
        id: Uuid,
        observe: bool,
    ) -> ConductorResult<(Workflow, Option<ProgressSubscription>)> {
        let inner = &self.inner;
        let known = inner
            .store
            .get_workflow(id)
            .await?
            .ok_or(ConductorError::WorkflowNotFound(id))?;
        if known.is_terminal() {
            return Err(ConductorError::invalid_transition(
                known.status,
                WorkflowStatus::Running,
            ));
        }

        let run_id = Uuid::new_v4();
        let (pause_tx, pause_rx) = watch::channel(false);
        let pause_tx = Arc::new(pause_tx);
        let (done_tx, done_rx) = watch::channel(false);
        let forced = Arc::new(AtomicBool::new(false));
        let cancel = {
            let mut runners = inner.runners.lock();
            if runners.contains_key(&id) || inner.bus.is_active(id) {
                return Err(ConductorError::AlreadyRunning(id));
            }
            let cancel = inner.bus.open(id);
            runners.insert(
                id,
                RunnerSlot {
                    run_id,
                    cancel: cancel.clone(),
                    pause_tx: pause_tx.clone(),
                    handle: None,
                    done_rx: done_rx.clone(),
                    forced: forced.clone(),
                },
            );
            cancel
        };
        let guard = RunnerGuard {
            inner: inner.clone(),
            workflow_id: id,
            run_id,
            done_tx,
            forced,
        };

        if !inner
            .store
            .claim_runner(id, run_id, inner.config.runner_lease())
            .await?
        {
            info!(workflow_id = %id, "runner lease held by a live process");
            return Err(ConductorError::AlreadyRunning(id));
        }

        // The previous holder may have advanced the record before letting go.
        let (mut workflow, start_index, previous) = match self.load_resume_state(id).await {
            Ok(state) => state,
            Err(e) => {
                inner.release_lease(id, run_id).await;
                return Err(e);
            }
        };
        pause_tx.send_replace(workflow.status == WorkflowStatus::Paused);

        let orphan = workflow.status != WorkflowStatus::Pending;
        if !orphan {
            workflow.transition(WorkflowStatus::Running)?;
        }
        workflow.record_progress(start_index as u32);
        if let Err(e) = inner.store.save_workflow(&workflow).await {
            error!(workflow_id = %id, error = %e, "failed to persist start");
            inner.release_lease(id, run_id).await;
            drop(guard);
            return Err(e);
        }

        let subscription = if observe { inner.bus.subscribe(id) } else { None };
        let message = if orphan {
            format!(
                "Workflow recovered at step {}/{}",
                (start_index + 1).min(workflow.total_steps as usize),
                workflow.total_steps
            )
        } else {
            "Workflow started".to_string()
        };
        inner
            .bus
            .publish(ProgressEvent::from_workflow(&workflow, message));
        info!(
            workflow_id = %id,
            %run_id,
            status = %workflow.status,
            start_step = start_index + 1,
            orphan,
            "workflow runner starting"
        );

        let lease_lost = Arc::new(AtomicBool::new(false));
        let run = Run {
            inner: inner.clone(),
            workflow: workflow.clone(),
            persisted: workflow.clone(),
            cancel: cancel.clone(),
            pause_rx,
            _pause_tx: pause_tx.clone(),
            previous,
            start_index,
            lease_lost: lease_lost.clone(),
        };
        let owner = inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run.drive().await;
            owner.release_lease(id, run_id).await;
        });
        tokio::spawn(
            ControlWatch {
                store: inner.store.clone(),
                workflow_id: id,
                run_id,
                cancel,
                pause_tx,
                done_rx,
                poll: inner.config.control_poll(),
                heartbeat: inner.config.heartbeat_interval(),
                lease_lost,
            }
            .run(),
        );

        if let Some(slot) = inner.runners.lock().get_mut(&id) {
            if slot.run_id == run_id {
                slot.handle = Some(handle);
            }
        }
        Ok((workflow, subscription))
    }

    /// The stored record plus where its steps left off.
    async fn load_resume_state(
        &self,
        id: Uuid,
    ) -> ConductorResult<(Workflow, usize, BTreeMap<String, ParamValue>)> {
        let workflow = self.status(id).await?;
        if workflow.is_terminal() {
            return Err(ConductorError::invalid_transition(
                workflow.status,
                WorkflowStatus::Running,
            ));
        }
        let stored_steps = self.inner.store.list_steps(id).await?;
        let (start_index, previous) = resume_point(workflow.steps(), &stored_steps);
        Ok((workflow, start_index, previous))
    }

    /// Pause a RUNNING workflow. Observed at the next step boundary.
    pub async fn pause(&self, id: Uuid) -> ConductorResult<ControlOutcome> {
        if let Some(pause_tx) = self.local_pause(id) {
            if *pause_tx.borrow() {
                return Err(ConductorError::invalid_transition(
                    WorkflowStatus::Paused,
                    WorkflowStatus::Paused,
                ));
            }
            pause_tx.send_replace(true);
            info!(workflow_id = %id, "pause requested");
            return Ok(ControlOutcome::Applied);
        }
        let workflow = self.status(id).await?;
        match workflow.status {
            WorkflowStatus::Running => self.queue(id, ControlRequest::Pause).await,
            other => Err(ConductorError::invalid_transition(
                other,
                WorkflowStatus::Paused,
            )),
        }
    }

    /// Resume a PAUSED workflow.
    pub async fn resume(&self, id: Uuid) -> ConductorResult<ControlOutcome> {
        if let Some(pause_tx) = self.local_pause(id) {
            if !*pause_tx.borrow() {
                return Err(ConductorError::invalid_transition(
                    WorkflowStatus::Running,
                    WorkflowStatus::Running,
                ));
            }
            pause_tx.send_replace(false);
            info!(workflow_id = %id, "resume requested");
            return Ok(ControlOutcome::Applied);
        }
        let workflow = self.status(id).await?;
        match workflow.status {
            WorkflowStatus::Paused => self.queue(id, ControlRequest::Resume).await,
            other => Err(ConductorError::invalid_transition(
                other,
                WorkflowStatus::Running,
            )),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// A local runner stops before its next step or abandons the step in
    /// flight. A PENDING workflow with no runner is cancelled on the spot.
    pub async fn cancel(&self, id: Uuid) -> ConductorResult<ControlOutcome> {
        let local = self
            .inner
            .runners
            .lock()
            .get(&id)
            .map(|slot| slot.cancel.clone());
        if let Some(token) = local {
            token.cancel();
            info!(workflow_id = %id, "cancellation requested");
            return Ok(ControlOutcome::Applied);
        }

        let mut workflow = self.status(id).await?;
        match workflow.status {
            WorkflowStatus::Running | WorkflowStatus::Paused => {
                self.queue(id, ControlRequest::Cancel).await
            }
            WorkflowStatus::Pending => {
                workflow.transition(WorkflowStatus::Cancelled)?;
                self.inner.store.save_workflow(&workflow).await?;
                info!(workflow_id = %id, "pending workflow cancelled");
                self.inner
                    .raise(cancelled_alert(&workflow, "cancelled before it started"))
                    .await;
                Ok(ControlOutcome::Applied)
            }
            other => Err(ConductorError::invalid_transition(
                other,
                WorkflowStatus::Cancelled,
            )),
        }
    }

    /// Cancel, wait the grace period, then abort the runner if it has not stopped.
    ///
    /// After an abort the workflow is finalized as CANCELLED from the last
    /// record the store holds, best effort.
    pub async fn force_cancel(&self, id: Uuid) -> ConductorResult<ControlOutcome> {
        let local = self
            .inner
            .runners
            .lock()
            .get(&id)
            .map(|slot| (slot.run_id, slot.cancel.clone(), slot.done_rx.clone()));
        let Some((run_id, token, mut done_rx)) = local else {
            return self.cancel(id).await;
        };

        token.cancel();
        let grace = self.inner.config.cancel_grace();
        if tokio::time::timeout(grace, done_rx.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return Ok(ControlOutcome::Applied);
        }

        warn!(
            workflow_id = %id,
            grace_secs = grace.as_secs(),
            "runner did not stop in time; aborting"
        );
        if !self.abort_run(id, run_id).await {
            debug!(workflow_id = %id, "runner stopped on its own before the abort");
        }
        Ok(ControlOutcome::Applied)
    }

    /// Abort run `run_id` of `id` and finalize it as cancelled.
    ///
    /// Does nothing and returns `false` once that run has released its slot,
    /// so a run started after it keeps its slot and progress channel.
    async fn abort_run(&self, id: Uuid, run_id: Uuid) -> bool {
        let handle = {
            let mut runners = self.inner.runners.lock();
            match runners.get_mut(&id) {
                Some(slot) if slot.run_id == run_id => {
                    slot.forced.store(true, Ordering::SeqCst);
                    slot.handle.take()
                }
                _ => return false,
            }
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }

        self.finalize_forced(id).await;
        self.inner.release_lease(id, run_id).await;
        // The forced guard left the channel open; nothing else can claim it yet.
        self.inner.bus.close(id);
        true
    }

    async fn finalize_forced(&self, id: Uuid) {
        let store = &self.inner.store;
        let mut workflow = match store.get_workflow(id).await {
            Ok(Some(wf)) if !wf.is_terminal() => wf,
            Ok(_) => return,
            Err(e) => {
                error!(workflow_id = %id, error = %e, "cannot load workflow after abort");
                return;
            }
        };
        if let Err(e) = workflow.transition(WorkflowStatus::Cancelled) {
            warn!(workflow_id = %id, error = %e, "cannot cancel aborted workflow");
            return;
        }
        match store.save_workflow(&workflow).await {
            Ok(()) => {
                self.inner.bus.publish(ProgressEvent::from_workflow(
                    &workflow,
                    "Workflow cancelled (forced)",
                ));
                info!(workflow_id = %id, progress = workflow.progress_percent, "workflow force-cancelled");
                self.inner
                    .raise(cancelled_alert(&workflow, "runner aborted after the grace period"))
                    .await;
            }
            Err(e) => {
                error!(workflow_id = %id, error = %e, "failed to persist forced cancellation");
            }
        }
    }

    /// Wait for the local runner to stop, then return the stored workflow.
    ///
    /// Without a local runner this returns the stored record immediately.
    pub async fn wait(&self, id: Uuid) -> ConductorResult<Workflow> {
        let done = self
            .inner
            .runners
            .lock()
            .get(&id)
            .map(|slot| slot.done_rx.clone());
        if let Some(mut done_rx) = done {
            let _ = done_rx.wait_for(|done| *done).await;
        }
        self.status(id).await
    }

    /// The stored workflow.
    pub async fn status(&self, id: Uuid) -> ConductorResult<Workflow> {
        self.inner
            .store
            .get_workflow(id)
            .await?
            .ok_or(ConductorError::WorkflowNotFound(id))
    }

    /// The stored steps of a workflow, in order.
    pub async fn steps(&self, id: Uuid) -> ConductorResult<Vec<Step>> {
        self.inner.store.list_steps(id).await
    }

    /// All non-terminal workflows.
    pub async fn list_active(&self) -> ConductorResult<Vec<Workflow>> {
        self.inner.store.list_active().await
    }

    /// Terminal workflows, newest first. `page` is zero-based.
    pub async fn history(&self, page: u32, page_size: u32) -> ConductorResult<Vec<Workflow>> {
        self.inner.store.list_history(page, page_size).await
    }

    /// Follow a workflow's progress. `None` without a local runner.
    pub fn subscribe(&self, id: Uuid) -> Option<ProgressSubscription> {
        self.inner.bus.subscribe(id)
    }

    /// Whether this engine is running `id`.
    pub fn is_running(&self, id: Uuid) -> bool {
        self.inner.runners.lock().contains_key(&id)
    }

    /// Force-cancel every local runner.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.inner.runners.lock().keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!(runners = ids.len(), "shutting down workflow runners");
        let results = join_all(ids.iter().map(|id| self.force_cancel(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(workflow_id = %id, error = %e, "shutdown cancel failed");
            }
        }
    }

    fn local_pause(&self, id: Uuid) -> Option<Arc<watch::Sender<bool>>> {
        self.inner
            .runners
            .lock()
            .get(&id)
            .map(|slot| slot.pause_tx.clone())
    }

    async fn queue(&self, id: Uuid, request: ControlRequest) -> ConductorResult<ControlOutcome> {
        self.inner.store.request_control(id, request).await?;
        info!(workflow_id = %id, request = %request, "control request queued for owning process");
        Ok(ControlOutcome::Queued)
    }
}

/// Index of the first step to run and the results of the steps before it.
fn resume_point(
    templates: &[StepTemplate],
    stored: &[Step],
) -> (usize, BTreeMap<String, ParamValue>) {
    let mut previous = BTreeMap::new();
    for (idx, template) in templates.iter().enumerate() {
        let number = idx as u32 + 1;
        let done = stored
            .iter()
            .find(|s| s.step_number == number && s.status == StepStatus::Completed);
        match done {
            Some(step) => {
                previous.insert(
                    template.key.to_string(),
                    step.result.clone().unwrap_or(ParamValue::Null),
                );
            }
            None => return (idx, previous),
        }
    }
    (templates.len(), previous)
}

fn cancelled_alert(workflow: &Workflow, detail: &str) -> Alert {
    Alert::new(
        AlertType::WorkflowCancelled,
        AlertSeverity::Info,
        "Workflow cancelled",
        format!(
            "{} workflow {} {detail} at {}%",
            workflow.workflow_type, workflow.id, workflow.progress_percent
        ),
    )
    .for_workflow(workflow.id)
}

/// Per-run companion task: renews the runner lease and applies control
/// requests queued by other processes, until the runner stops.
struct ControlWatch {
    store: Arc<dyn WorkflowStore>,
    workflow_id: Uuid,
    run_id: Uuid,
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    poll: Duration,
    heartbeat: Duration,
    lease_lost: Arc<AtomicBool>,
}

impl ControlWatch {
    async fn run(mut self) {
        let id = self.workflow_id;
        let tick = self.poll.min(self.heartbeat);
        let mut last_beat = Instant::now();
        loop {
            if *self.done_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = self.done_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(tick) => {}
            }

            if last_beat.elapsed() >= self.heartbeat {
                match self.store.renew_runner(id, self.run_id).await {
                    Ok(true) => last_beat = Instant::now(),
                    Ok(false) => {
                        warn!(workflow_id = %id, run_id = %self.run_id, "runner lease taken over; stopping");
                        self.lease_lost.store(true, Ordering::SeqCst);
                        self.cancel.cancel();
                        break;
                    }
                    Err(e) => warn!(workflow_id = %id, error = %e, "failed to renew runner lease"),
                }
            }

            // Keep renewing while a cancelled runner winds down.
            if self.cancel.is_cancelled() {
                continue;
            }
            match self.store.take_control(id).await {
                Ok(Some(ControlRequest::Pause)) => {
                    self.pause_tx.send_replace(true);
                }
                Ok(Some(ControlRequest::Resume)) => {
                    self.pause_tx.send_replace(false);
                }
                Ok(Some(ControlRequest::Cancel)) => self.cancel.cancel(),
                Ok(None) => continue,
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "failed to poll control requests");
                    continue;
                }
            }
            debug!(workflow_id = %id, "applied queued control request");
        }
    }
}

/// Releases the runner slot and closes the progress channel however the task ends.
struct RunnerGuard {
    inner: Arc<Inner>,
    workflow_id: Uuid,
    run_id: Uuid,
    done_tx: watch::Sender<bool>,
    forced: Arc<AtomicBool>,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        // Close before releasing the slot so a new start cannot reuse this channel.
        if !self.forced.load(Ordering::SeqCst) {
            self.inner.bus.close(self.workflow_id);
        }
        {
            let mut runners = self.inner.runners.lock();
            if runners
                .get(&self.workflow_id)
                .is_some_and(|slot| slot.run_id == self.run_id)
            {
                runners.remove(&self.workflow_id);
            }
        }
        self.done_tx.send_replace(true);
    }
}

enum StepEnd {
    Next,
    Stop(Finish),
}

enum Finish {
    Completed,
    Failed(String),
    Cancelled,
}

enum Invocation {
    Done(ParamValue),
    Failed(String),
    Cancelled,
}

/// State owned by one runner task.
struct Run {
    inner: Arc<Inner>,
    workflow: Workflow,
    /// Last record the store accepted.
    persisted: Workflow,
    cancel: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    _pause_tx: Arc<watch::Sender<bool>>,
    previous: BTreeMap<String, ParamValue>,
    start_index: usize,
    /// Set when another process adopted the workflow; this run must not write again.
    lease_lost: Arc<AtomicBool>,
}

impl Run {
    async fn drive(mut self) {
        let id = self.workflow.id;
        let finish = match self.run_steps().await {
            Ok(finish) => finish,
            Err(e) => {
                error!(workflow_id = %id, error = %e, "runner stopped; workflow left for recovery");
                return;
            }
        };
        if self.lease_lost() {
            warn!(workflow_id = %id, "runner lease lost; leaving workflow to its new owner");
            return;
        }
        if let Err(e) = self.finish(finish).await {
            error!(workflow_id = %id, error = %e, "failed to finalize workflow; left for recovery");
        }
    }

    async fn run_steps(&mut self) -> ConductorResult<Finish> {
        let templates = self.workflow.steps();
        for idx in self.start_index..templates.len() {
            if !self.checkpoint().await? {
                return Ok(Finish::Cancelled);
            }
            if let StepEnd::Stop(finish) = self.run_step(idx, &templates[idx]).await? {
                return Ok(finish);
            }
        }
        // A pause or cancel that arrived during the last step holds here too.
        if !self.checkpoint().await? {
            return Ok(Finish::Cancelled);
        }
        Ok(Finish::Completed)
    }

    fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Honor pause and cancellation between steps. `false` means cancelled.
    async fn checkpoint(&mut self) -> ConductorResult<bool> {
        let poll = self.inner.config.control_poll();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let paused = *self.pause_rx.borrow_and_update();
            if !paused {
                if self.workflow.status == WorkflowStatus::Paused {
                    self.workflow.transition(WorkflowStatus::Running)?;
                    self.commit("Workflow resumed").await?;
                    info!(workflow_id = %self.workflow.id, "workflow resumed");
                }
                return Ok(true);
            }
            if self.workflow.status == WorkflowStatus::Running {
                self.workflow.transition(WorkflowStatus::Paused)?;
                self.commit("Workflow paused").await?;
                info!(workflow_id = %self.workflow.id, "workflow paused");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.pause_rx.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn run_step(&mut self, idx: usize, template: &StepTemplate) -> ConductorResult<StepEnd> {
        let id = self.workflow.id;
        let number = idx as u32 + 1;
        let total = self.workflow.total_steps;

        self.workflow.current_step = number;
        self.commit(format!("Step {number}/{total}: {}", template.title))
            .await?;

        let mut step = Step::started(id, number, template.title, template.agent_id);
        self.save_step(&step).await?;
        info!(
            workflow_id = %id,
            step = number,
            agent = template.agent_id,
            action = template.action,
            "step dispatched"
        );

        let params = self.step_params(template, number);
        let started = Instant::now();
        let invocation = self.invoke(template, &params).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match invocation {
            Invocation::Done(result) => {
                step.complete(result.clone(), elapsed);
                self.save_step(&step).await?;
                self.previous.insert(template.key.to_string(), result);
                self.workflow.record_progress(number);
                self.commit(format!("Step {number}/{total} completed: {}", template.title))
                    .await?;
                info!(workflow_id = %id, step = number, duration_ms = elapsed, "step completed");
                Ok(StepEnd::Next)
            }
            Invocation::Failed(err) => {
                warn!(workflow_id = %id, step = number, error = %err, "step failed");
                step.fail(err.clone(), elapsed);
                self.save_step_best_effort(&step).await;
                Ok(StepEnd::Stop(Finish::Failed(format!(
                    "Step {number} ({}) failed: {err}",
                    template.key
                ))))
            }
            Invocation::Cancelled => {
                info!(workflow_id = %id, step = number, "step interrupted by cancellation");
                if !self.lease_lost() {
                    step.cancel();
                    self.save_step_best_effort(&step).await;
                }
                Ok(StepEnd::Stop(Finish::Cancelled))
            }
        }
    }

    async fn invoke(&self, template: &StepTemplate, params: &Value) -> Invocation {
        let dispatcher = self.inner.dispatcher.clone();
        let timeout = self.inner.config.step_timeout();
        let call = AssertUnwindSafe(dispatcher.invoke(template.agent_id, template.action, params))
            .catch_unwind();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Invocation::Cancelled,
            res = tokio::time::timeout(timeout, call) => match res {
                Err(_) => Invocation::Failed(format!(
                    "agent {} timed out after {}s",
                    template.agent_id,
                    timeout.as_secs()
                )),
                Ok(Err(panic)) => Invocation::Failed(format!(
                    "agent {} panicked: {}",
                    template.agent_id,
                    panic_message(panic.as_ref())
                )),
                Ok(Ok(outcome)) => outcome_to_invocation(outcome),
            },
        }
    }

    fn step_params(&self, template: &StepTemplate, number: u32) -> Value {
        let mut params: serde_json::Map<String, Value> = self
            .workflow
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        let previous: serde_json::Map<String, Value> = self
            .previous
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        params.insert("request".into(), json!(self.workflow.request));
        params.insert("project".into(), json!(self.workflow.project));
        params.insert("step".into(), json!(template.key));
        params.insert("step_number".into(), json!(number));
        params.insert("workflow_id".into(), json!(self.workflow.id.to_string()));
        params.insert("previous".into(), Value::Object(previous));
        Value::Object(params)
    }

    async fn finish(&mut self, finish: Finish) -> ConductorResult<()> {
        let id = self.workflow.id;
        match finish {
            Finish::Completed => {
                self.workflow.result = Some(ParamValue::Map(self.previous.clone()));
                self.workflow.transition(WorkflowStatus::Completed)?;
                self.commit("Workflow completed").await?;
                info!(workflow_id = %id, "workflow completed");
            }
            Finish::Failed(err) => {
                self.workflow.error = Some(err.clone());
                self.workflow.transition(WorkflowStatus::Failed)?;
                self.commit(err.clone()).await?;
                error!(workflow_id = %id, error = %err, "workflow failed");
                let alert = Alert::new(
                    AlertType::WorkflowFailed,
                    AlertSeverity::Error,
                    "Workflow failed",
                    format!("{} workflow {id}: {err}", self.workflow.workflow_type),
                )
                .for_workflow(id);
                self.inner.raise(alert).await;
            }
            Finish::Cancelled => {
                self.workflow.transition(WorkflowStatus::Cancelled)?;
                self.commit("Workflow cancelled").await?;
                info!(workflow_id = %id, progress = self.workflow.progress_percent, "workflow cancelled");
                self.inner
                    .raise(cancelled_alert(&self.workflow, "was cancelled"))
                    .await;
            }
        }
        Ok(())
    }

    /// Persist the current record, then broadcast it.
    ///
    /// On failure the in-memory record reverts to the last persisted one so
    /// the runner never acts on state the store does not hold.
    async fn commit(&mut self, message: impl Into<String>) -> ConductorResult<()> {
        match self.inner.store.save_workflow(&self.workflow).await {
            Ok(()) => {
                self.persisted = self.workflow.clone();
                self.inner
                    .bus
                    .publish(ProgressEvent::from_workflow(&self.workflow, message));
                Ok(())
            }
            Err(e) => {
                let attempted = self.workflow.status;
                self.workflow = self.persisted.clone();
                error!(
                    workflow_id = %self.workflow.id,
                    status = %attempted,
                    error = %e,
                    "failed to persist workflow transition"
                );
                let alert = Alert::new(
                    AlertType::PersistenceFailure,
                    AlertSeverity::Critical,
                    "Workflow state not saved",
                    format!(
                        "could not save workflow {} as {attempted}; last saved state is {}: {e}",
                        self.workflow.id, self.workflow.status
                    ),
                )
                .for_workflow(self.workflow.id);
                self.inner.raise(alert).await;
                Err(e)
            }
        }
    }

    async fn save_step(&self, step: &Step) -> ConductorResult<()> {
        self.inner.store.save_step(step).await.map_err(|e| {
            error!(
                workflow_id = %step.workflow_id,
                step = step.step_number,
                error = %e,
                "failed to persist step"
            );
            e
        })
    }

    async fn save_step_best_effort(&self, step: &Step) {
        let _ = self.save_step(step).await;
    }
}

fn outcome_to_invocation(outcome: InvocationOutcome) -> Invocation {
    if outcome.success {
        Invocation::Done(outcome.result.map(ParamValue::from).unwrap_or(ParamValue::Null))
    } else {
        Invocation::Failed(
            outcome
                .error
                .unwrap_or_else(|| "agent reported failure without detail".to_string()),
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
