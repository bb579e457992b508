use crate::sqlite::{sql_err, ts, upsert_alert, upsert_step, upsert_workflow};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use conductor_core::{
    Alert, AlertSeverity, AlertType, ConductorError, ConductorResult, ParamValue, Parameters,
    Step, StepStatus, Workflow, WorkflowStatus, WorkflowType,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `store_meta` key recording that the legacy cache has been imported.
pub const MIGRATED_FLAG: &str = "legacy_cache_migrated";

const WORKFLOW_PREFIX: &str = "workflow:";
const STEPS_PREFIX: &str = "steps:";
const ALERT_PREFIX: &str = "alert:";

/// Outcome of the one-time legacy cache import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Whether the migration ran during this open. `false` once the flag is set.
    pub ran: bool,
    pub workflows: usize,
    pub steps: usize,
    pub alerts: usize,
    /// Records that failed validation and were left behind.
    pub skipped: usize,
}

/// Import the legacy cache unless a previous open already did.
///
/// The import and the flag share one transaction, so a crash mid-way leaves
/// neither behind and the next open starts over.
pub(crate) fn run_once(
    conn: &mut Connection,
    legacy_cache: Option<&Path>,
) -> ConductorResult<MigrationReport> {
    let done: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![MIGRATED_FLAG],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)?;
    if let Some(at) = done {
        debug!(migrated_at = %at, "Legacy cache already migrated");
        return Ok(MigrationReport::default());
    }

    let records = match legacy_cache {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path)?;
            let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
                ConductorError::Persistence(format!(
                    "legacy cache {} is not valid JSON: {e}",
                    path.display()
                ))
            })?;
            match parsed {
                Value::Object(map) => map,
                _ => {
                    return Err(ConductorError::Persistence(format!(
                        "legacy cache {} is not a JSON object",
                        path.display()
                    )))
                }
            }
        }
        _ => Map::new(),
    };

    let tx = conn.transaction().map_err(sql_err)?;
    let report = import(&tx, &records)?;
    tx.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![MIGRATED_FLAG, ts(&Utc::now())],
    )
    .map_err(sql_err)?;
    tx.commit().map_err(sql_err)?;

    info!(
        workflows = report.workflows,
        steps = report.steps,
        alerts = report.alerts,
        skipped = report.skipped,
        "Legacy cache migration complete"
    );
    Ok(report)
}

fn import(conn: &Connection, records: &Map<String, Value>) -> ConductorResult<MigrationReport> {
    let mut report = MigrationReport {
        ran: true,
        ..MigrationReport::default()
    };

    // Workflows first so steps and alerts can reference them.
    let mut known: HashSet<Uuid> = HashSet::new();
    for (key, value) in records {
        let Some(id) = key.strip_prefix(WORKFLOW_PREFIX) else {
            continue;
        };
        match legacy_workflow(id, value) {
            Ok(wf) => match upsert_workflow(conn, &wf) {
                Ok(()) => {
                    known.insert(wf.id);
                    report.workflows += 1;
                }
                Err(e) => skip(&mut report, key, &e.to_string()),
            },
            Err(reason) => skip(&mut report, key, &reason),
        }
    }

    for (key, value) in records {
        let Some(id) = key.strip_prefix(STEPS_PREFIX) else {
            continue;
        };
        let workflow_id = match Uuid::parse_str(id.trim()) {
            Ok(id) if known.contains(&id) || workflow_exists(conn, id)? => id,
            Ok(_) => {
                skip(&mut report, key, "steps for unknown workflow");
                continue;
            }
            Err(e) => {
                skip(&mut report, key, &e.to_string());
                continue;
            }
        };
        let Some(list) = value.as_array() else {
            skip(&mut report, key, "steps record is not a list");
            continue;
        };
        for (idx, raw) in list.iter().enumerate() {
            match legacy_step(workflow_id, idx, raw) {
                Ok(step) => match upsert_step(conn, &step) {
                    Ok(()) => report.steps += 1,
                    Err(e) => skip(&mut report, key, &e.to_string()),
                },
                Err(reason) => skip(&mut report, key, &reason),
            }
        }
    }

    for (key, value) in records {
        let Some(id) = key.strip_prefix(ALERT_PREFIX) else {
            continue;
        };
        match legacy_alert(id, value) {
            Ok(alert) => match upsert_alert(conn, &alert) {
                Ok(()) => report.alerts += 1,
                Err(e) => skip(&mut report, key, &e.to_string()),
            },
            Err(reason) => skip(&mut report, key, &reason),
        }
    }

    Ok(report)
}

fn skip(report: &mut MigrationReport, key: &str, reason: &str) {
    warn!(key = %key, reason = %reason, "Skipping legacy cache record");
    report.skipped += 1;
}

fn workflow_exists(conn: &Connection, id: Uuid) -> ConductorResult<bool> {
    conn.query_row(
        "SELECT 1 FROM workflows WHERE id = ?1",
        params![id.to_string()],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(sql_err)
}

// --- Lenient field readers ---

fn text<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn number(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn count(obj: &Map<String, Value>, keys: &[&str]) -> Result<Option<u32>, String> {
    match number(obj, keys) {
        None => Ok(None),
        Some(n) if n >= 0.0 && n <= f64::from(u32::MAX) => Ok(Some(n as u32)),
        Some(n) => Err(format!("{} out of range: {n}", keys[0])),
    }
}

fn timestamp(obj: &Map<String, Value>, key: &str) -> Result<Option<DateTime<Utc>>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single())
            .map(Some)
            .ok_or_else(|| format!("{key} is not a valid epoch")),
        Some(Value::String(s)) => parse_legacy_ts(s)
            .map(Some)
            .ok_or_else(|| format!("{key} is not a timestamp: {s}")),
        Some(_) => Err(format!("{key} has an unexpected type")),
    }
}

/// RFC 3339, or a zone-less ISO form which is taken as UTC.
fn parse_legacy_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn value_field(obj: &Map<String, Value>, key: &str) -> Option<ParamValue> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(ParamValue::from(v.clone())),
    }
}

fn legacy_workflow(key_id: &str, value: &Value) -> Result<Workflow, String> {
    let obj = value.as_object().ok_or("workflow record is not an object")?;

    let id = text(obj, &["id"]).unwrap_or(key_id);
    let id = Uuid::parse_str(id).map_err(|e| format!("invalid id: {e}"))?;
    let workflow_type: WorkflowType = text(obj, &["workflow_type", "type"])
        .ok_or("missing workflow type")?
        .parse()
        .map_err(|e: ConductorError| e.to_string())?;
    let status: WorkflowStatus = text(obj, &["status"])
        .ok_or("missing status")?
        .parse()
        .map_err(|e: ConductorError| e.to_string())?;
    let request = text(obj, &["request"]).ok_or("missing request")?.to_string();

    let parameters: Parameters = match obj.get("parameters") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), ParamValue::from(v.clone())))
            .collect(),
        None | Some(Value::Null) => Parameters::new(),
        Some(_) => return Err("parameters is not an object".into()),
    };

    let progress = number(obj, &["progress_percent", "progress"]).unwrap_or(0.0);
    if !(0.0..=100.0).contains(&progress) {
        return Err(format!("progress out of range: {progress}"));
    }

    let created_at = timestamp(obj, "created_at")?.unwrap_or_else(Utc::now);
    let started_at = timestamp(obj, "started_at")?;
    let paused_at = timestamp(obj, "paused_at")?;
    let completed_at = timestamp(obj, "completed_at")?;
    let failed_at = timestamp(obj, "failed_at")?;
    let cancelled_at = timestamp(obj, "cancelled_at")?;
    let updated_at = match timestamp(obj, "updated_at")? {
        Some(at) => at,
        None => [started_at, paused_at, completed_at, failed_at, cancelled_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(created_at)
            .max(created_at),
    };

    let workflow = Workflow {
        id,
        workflow_type,
        status,
        project: text(obj, &["project"]).map(str::to_string),
        request,
        parameters,
        current_step: count(obj, &["current_step"])?.unwrap_or(0),
        total_steps: count(obj, &["total_steps"])?.unwrap_or(workflow_type.total_steps()),
        progress_percent: progress.round() as u8,
        created_at,
        started_at,
        paused_at,
        completed_at,
        failed_at,
        cancelled_at,
        updated_at,
        error: text(obj, &["error"]).map(str::to_string),
        result: value_field(obj, "result"),
    };
    workflow.validate().map_err(|e| e.to_string())?;
    Ok(workflow)
}

fn legacy_step(workflow_id: Uuid, idx: usize, value: &Value) -> Result<Step, String> {
    let obj = value.as_object().ok_or("step record is not an object")?;
    let step_number = count(obj, &["step_number", "step"])?.unwrap_or(idx as u32 + 1);
    if step_number == 0 {
        return Err("step numbers are 1-based".into());
    }
    let status: StepStatus = text(obj, &["status"])
        .ok_or("missing step status")?
        .parse()
        .map_err(|e: ConductorError| e.to_string())?;

    Ok(Step {
        workflow_id,
        step_number,
        title: text(obj, &["title", "name"])
            .unwrap_or("Untitled step")
            .to_string(),
        agent_id: text(obj, &["agent_id", "agent"])
            .unwrap_or("unknown")
            .to_string(),
        status,
        started_at: timestamp(obj, "started_at")?.unwrap_or_else(Utc::now),
        completed_at: timestamp(obj, "completed_at")?,
        duration_ms: number(obj, &["duration_ms"]).map(|ms| ms.max(0.0) as u64),
        result: value_field(obj, "result"),
        error: text(obj, &["error"]).map(str::to_string),
    })
}

fn legacy_alert(key_id: &str, value: &Value) -> Result<Alert, String> {
    let obj = value.as_object().ok_or("alert record is not an object")?;
    let id = text(obj, &["id"]).unwrap_or(key_id);
    let id = Uuid::parse_str(id).map_err(|e| format!("invalid id: {e}"))?;
    let alert_type: AlertType = text(obj, &["alert_type", "type"])
        .ok_or("missing alert type")?
        .parse()
        .map_err(|e: ConductorError| e.to_string())?;
    let severity: AlertSeverity = match text(obj, &["severity"]) {
        Some(raw) => raw.parse().map_err(|e: ConductorError| e.to_string())?,
        None => AlertSeverity::Info,
    };
    let workflow_id = text(obj, &["workflow_id"])
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|e| format!("invalid workflow_id: {e}"))?;

    Ok(Alert {
        id,
        alert_type,
        severity,
        title: text(obj, &["title"]).unwrap_or("Alert").to_string(),
        message: text(obj, &["message"]).unwrap_or_default().to_string(),
        workflow_id,
        created_at: timestamp(obj, "created_at")?.unwrap_or_else(Utc::now),
    })
}
