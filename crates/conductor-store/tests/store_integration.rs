#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the conductor-store crate.
//!
//! Covers idempotent upserts, read-only finished workflows, step uniqueness,
//! restart recovery, runner leases, history ordering and pagination, provider
//! health persistence, and the one-time legacy cache migration.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use conductor_core::{
    Alert, AlertSeverity, AlertType, ControlRequest, NewWorkflow, ParamValue, ProviderHealth,
    Step, StepStatus, Workflow, WorkflowStatus, WorkflowType,
};
use conductor_store::{HealthStore, SqliteWorkflowStore, WorkflowStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("data").join("conductor.db")
}

async fn open(tmp: &TempDir) -> SqliteWorkflowStore {
    SqliteWorkflowStore::open(db_path(tmp), None).await.unwrap()
}

fn pipeline(request: &str) -> Workflow {
    Workflow::new(NewWorkflow::new(WorkflowType::DeliveryPipeline, request))
}

fn finished(request: &str, status: WorkflowStatus, offset_secs: i64) -> Workflow {
    let mut wf = pipeline(request);
    wf.transition(WorkflowStatus::Running).unwrap();
    wf.transition(status).unwrap();
    wf.updated_at = Utc::now() + Duration::seconds(offset_secs);
    wf
}

// ---------------------------------------------------------------------------
// 1. Upserts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_saves_do_not_duplicate() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let mut wf = pipeline("Build X");
    wf.parameters.insert("tier".into(), ParamValue::Int(2));
    for _ in 0..3 {
        store.save_workflow(&wf).await.unwrap();
    }
    wf.transition(WorkflowStatus::Running).unwrap();
    wf.current_step = 1;
    store.save_workflow(&wf).await.unwrap();

    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    let loaded = store.get_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Running);
    assert_eq!(loaded.current_step, 1);
    assert_eq!(loaded.parameters.get("tier"), Some(&ParamValue::Int(2)));
    assert_eq!(loaded.started_at, wf.started_at);
}

#[tokio::test]
async fn resaving_workflow_keeps_steps_and_alerts() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let mut wf = pipeline("Build X");
    store.save_workflow(&wf).await.unwrap();

    let mut step = Step::started(wf.id, 1, "Plan", "planner");
    store.save_step(&step).await.unwrap();
    step.complete(ParamValue::Text("a plan".into()), 42);
    store.save_step(&step).await.unwrap();
    store.save_step(&step).await.unwrap();

    let alert = Alert::new(AlertType::WorkflowFailed, AlertSeverity::Error, "t", "m")
        .for_workflow(wf.id);
    store.save_alert(&alert).await.unwrap();
    store.save_alert(&alert).await.unwrap();

    wf.transition(WorkflowStatus::Running).unwrap();
    store.save_workflow(&wf).await.unwrap();

    let steps = store.list_steps(wf.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].duration_ms, Some(42));
    assert_eq!(steps[0].result, Some(ParamValue::Text("a plan".into())));

    let alerts = store.list_alerts(Some(wf.id), 10).await.unwrap();
    assert_eq!(alerts.len(), 1);
}

#[tokio::test]
async fn steps_are_ordered_by_number() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let wf = pipeline("Build X");
    store.save_workflow(&wf).await.unwrap();

    for n in [3, 1, 2] {
        store
            .save_step(&Step::started(wf.id, n, format!("Step {n}"), "coder"))
            .await
            .unwrap();
    }
    let numbers: Vec<u32> = store
        .list_steps(wf.id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.step_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn step_for_unknown_workflow_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let step = Step::started(Uuid::new_v4(), 1, "Plan", "planner");
    assert!(store.save_step(&step).await.is_err());
}

#[tokio::test]
async fn finished_workflow_is_not_overwritten_by_stale_save() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let mut wf = pipeline("Build X");
    wf.transition(WorkflowStatus::Running).unwrap();
    wf.current_step = 1;
    store.save_workflow(&wf).await.unwrap();
    let stale = wf.clone();

    wf.transition(WorkflowStatus::Cancelled).unwrap();
    store.save_workflow(&wf).await.unwrap();

    // A late write from a runner that has not seen the cancel yet.
    let err = store.save_workflow(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        conductor_core::ConductorError::InvalidTransition { .. }
    ));
    // Re-saving the same terminal status stays idempotent.
    store.save_workflow(&wf).await.unwrap();

    let loaded = store.get_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Cancelled);
    assert!(loaded.cancelled_at.is_some());
    assert!(store.list_active().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// 2. Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reopen_reflects_last_committed_progress() {
    let tmp = TempDir::new().unwrap();
    let id = {
        let store = open(&tmp).await;
        let mut wf = pipeline("Build X");
        wf.transition(WorkflowStatus::Running).unwrap();
        wf.current_step = 2;
        wf.record_progress(2);
        store.save_workflow(&wf).await.unwrap();

        let mut step = Step::started(wf.id, 1, "Plan", "planner");
        step.complete(ParamValue::Text("plan".into()), 3);
        store.save_step(&step).await.unwrap();
        wf.id
    };

    let store = open(&tmp).await;
    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].status, WorkflowStatus::Running);
    assert_eq!(active[0].progress_percent, 50);
    assert_eq!(store.list_steps(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn runner_lease_is_exclusive_until_it_lapses() {
    let tmp = TempDir::new().unwrap();
    let lease = std::time::Duration::from_millis(200);
    let wf = pipeline("Build X");
    let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
    {
        let store = open(&tmp).await;
        store.save_workflow(&wf).await.unwrap();
        assert!(store.claim_runner(wf.id, owner, lease).await.unwrap());
    }

    // A second process sees the live lease through its own handle.
    let store = open(&tmp).await;
    assert!(!store.claim_runner(wf.id, other, lease).await.unwrap());
    assert!(!store.renew_runner(wf.id, other).await.unwrap());
    assert!(store.renew_runner(wf.id, owner).await.unwrap());
    assert!(store.claim_runner(wf.id, owner, lease).await.unwrap());

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(store.claim_runner(wf.id, other, lease).await.unwrap());
    assert!(!store.renew_runner(wf.id, owner).await.unwrap());

    store.release_runner(wf.id, owner).await.unwrap();
    assert!(!store.claim_runner(wf.id, owner, lease).await.unwrap());
    store.release_runner(wf.id, other).await.unwrap();
    assert!(store.claim_runner(wf.id, owner, lease).await.unwrap());
}

// ---------------------------------------------------------------------------
// 3. Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_is_newest_first_and_paginated() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let oldest = finished("one", WorkflowStatus::Completed, -30);
    let middle = finished("two", WorkflowStatus::Failed, -20);
    let newest = finished("three", WorkflowStatus::Cancelled, -10);
    for wf in [&middle, &newest, &oldest] {
        store.save_workflow(wf).await.unwrap();
    }
    store.save_workflow(&pipeline("still pending")).await.unwrap();

    let first = store.list_history(0, 2).await.unwrap();
    let ids: Vec<Uuid> = first.iter().map(|w| w.id).collect();
    assert_eq!(ids, vec![newest.id, middle.id]);

    let second = store.list_history(1, 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, oldest.id);

    assert!(store.list_history(2, 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_by_status_filters() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    store.save_workflow(&pipeline("a")).await.unwrap();
    store.save_workflow(&pipeline("b")).await.unwrap();
    store
        .save_workflow(&finished("c", WorkflowStatus::Failed, 0))
        .await
        .unwrap();

    assert_eq!(
        store.list_by_status(WorkflowStatus::Pending).await.unwrap().len(),
        2
    );
    assert_eq!(
        store.list_by_status(WorkflowStatus::Failed).await.unwrap().len(),
        1
    );
    assert!(store
        .list_by_status(WorkflowStatus::Paused)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn control_requests_are_consumed_once() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let id = Uuid::new_v4();

    store.request_control(id, ControlRequest::Pause).await.unwrap();
    store.request_control(id, ControlRequest::Resume).await.unwrap();

    let other = open(&tmp).await;
    assert_eq!(
        other.take_control(id).await.unwrap(),
        Some(ControlRequest::Resume)
    );
    assert_eq!(store.take_control(id).await.unwrap(), None);
}

#[tokio::test]
async fn provider_health_round_trips() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let mut a = ProviderHealth::healthy("a");
    a.adjust(-15);
    let mut b = ProviderHealth::healthy("b");
    b.score = 0;
    b.quarantine_until = Some(Utc::now() + Duration::seconds(300));
    store.save_health(&a).await.unwrap();
    store.save_health(&b).await.unwrap();
    a.adjust(5);
    store.save_health(&a).await.unwrap();

    let loaded = open(&tmp).await.load_health().await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].provider_id, "a");
    assert_eq!(loaded[0].score, 90);
    assert!(loaded[1].is_quarantined(Utc::now()));
}

#[tokio::test]
async fn older_health_write_does_not_replace_newer() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    // Two tasks read the same record and persist out of order.
    let mut older = ProviderHealth::healthy("primary");
    older.adjust(-10);
    let mut newer = older.clone();
    newer.adjust(-50);
    newer.updated_at = older.updated_at + Duration::milliseconds(5);

    store.save_health(&newer).await.unwrap();
    store.save_health(&older).await.unwrap();

    let loaded = store.load_health().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].score, 40);
}

// ---------------------------------------------------------------------------
// 4. Legacy cache migration
// ---------------------------------------------------------------------------

fn write_cache(tmp: &TempDir, body: serde_json::Value) -> PathBuf {
    let path = tmp.path().join("cache.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn migration_imports_records_and_skips_invalid() {
    let tmp = TempDir::new().unwrap();
    let running = Uuid::new_v4();
    let done = Uuid::new_v4();
    let alert = Uuid::new_v4();
    let cache = write_cache(
        &tmp,
        json!({
            format!("workflow:{running}"): {
                "id": running.to_string(),
                "type": "delivery_pipeline",
                "status": "RUNNING",
                "request": "Build X",
                "current_step": 2,
                "total_steps": 4,
                "progress": 25,
                "created_at": "2024-05-01T09:00:00"
            },
            format!("workflow:{done}"): {
                "workflow_type": "code_review",
                "status": "completed",
                "request": "Review PR 7",
                "progress_percent": 100,
                "current_step": 3,
                "completed_at": "2024-05-01T10:00:00Z"
            },
            "workflow:broken": {"type": "bug_fix", "status": "running", "request": "x"},
            format!("workflow:{}", Uuid::new_v4()): {
                "type": "bug_fix", "status": "exploded", "request": "y"
            },
            format!("steps:{running}"): [
                {"step_number": 1, "title": "Plan", "agent_id": "planner", "status": "completed",
                 "result": "plan text"},
                {"step_number": 2, "title": "Execute", "agent_id": "coder", "status": "running"},
                {"step_number": 3, "status": "sleeping"}
            ],
            format!("steps:{}", Uuid::new_v4()): [{"status": "completed"}],
            format!("alert:{alert}"): {
                "type": "workflow_failed",
                "severity": "ERROR",
                "title": "Failed",
                "message": "boom",
                "workflow_id": done.to_string()
            },
            "session:unrelated": {"anything": true}
        }),
    );

    let store = SqliteWorkflowStore::open(db_path(&tmp), Some(cache.clone()))
        .await
        .unwrap();
    let report = store.migration_report().clone();
    assert!(report.ran);
    assert_eq!(report.workflows, 2);
    assert_eq!(report.steps, 2);
    assert_eq!(report.alerts, 1);
    assert_eq!(report.skipped, 4);

    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, running);
    assert_eq!(active[0].progress_percent, 25);
    assert_eq!(store.list_steps(running).await.unwrap().len(), 2);
    assert_eq!(store.list_history(0, 10).await.unwrap()[0].id, done);
    assert_eq!(store.list_alerts(Some(done), 10).await.unwrap()[0].id, alert);
}

#[tokio::test]
async fn migration_never_reruns() {
    let tmp = TempDir::new().unwrap();
    let id = Uuid::new_v4();
    let cache = write_cache(
        &tmp,
        json!({
            format!("workflow:{id}"): {
                "type": "bug_fix", "status": "pending", "request": "Fix login"
            }
        }),
    );

    let first = SqliteWorkflowStore::open(db_path(&tmp), Some(cache.clone()))
        .await
        .unwrap();
    assert!(first.migration_report().ran);

    // A later transition must not be overwritten by a second import.
    let mut wf = first.get_workflow(id).await.unwrap().unwrap();
    wf.transition(WorkflowStatus::Cancelled).unwrap();
    first.save_workflow(&wf).await.unwrap();

    let second = SqliteWorkflowStore::open(db_path(&tmp), Some(cache))
        .await
        .unwrap();
    assert!(!second.migration_report().ran);
    let reloaded = second.get_workflow(id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn missing_cache_still_marks_migration_done() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.json");

    let first = SqliteWorkflowStore::open(db_path(&tmp), Some(missing.clone()))
        .await
        .unwrap();
    assert!(first.migration_report().ran);
    assert_eq!(first.migration_report().workflows, 0);

    // The file appearing later is ignored.
    let id = Uuid::new_v4();
    write_cache(
        &tmp,
        json!({ format!("workflow:{id}"): {"type": "bug_fix", "status": "pending", "request": "z"} }),
    );
    let second = SqliteWorkflowStore::open(db_path(&tmp), Some(tmp.path().join("cache.json")))
        .await
        .unwrap();
    assert!(!second.migration_report().ran);
    assert!(second.get_workflow(id).await.unwrap().is_none());
}

#[tokio::test]
async fn corrupt_cache_fails_open_without_setting_flag() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("cache.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let err = SqliteWorkflowStore::open(db_path(&tmp), Some(path.clone()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, conductor_core::ConductorError::Persistence(_)));

    std::fs::write(&path, b"{}").unwrap();
    let store = SqliteWorkflowStore::open(db_path(&tmp), Some(path))
        .await
        .unwrap();
    assert!(store.migration_report().ran);
}
