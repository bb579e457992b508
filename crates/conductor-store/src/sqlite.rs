use crate::migration::{self, MigrationReport};
use crate::{HealthStore, WorkflowStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use conductor_core::{
    Alert, ConductorError, ConductorResult, ControlRequest, ParamValue, Parameters,
    ProviderHealth, Step, Workflow, WorkflowStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        workflow_type TEXT NOT NULL,
        status TEXT NOT NULL,
        project TEXT,
        request TEXT NOT NULL,
        parameters TEXT NOT NULL,
        current_step INTEGER NOT NULL,
        total_steps INTEGER NOT NULL,
        progress_percent INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        paused_at TEXT,
        completed_at TEXT,
        failed_at TEXT,
        cancelled_at TEXT,
        updated_at TEXT NOT NULL,
        error TEXT,
        result TEXT
    );

    CREATE TABLE IF NOT EXISTS workflow_steps (
        workflow_id TEXT NOT NULL,
        step_number INTEGER NOT NULL,
        title TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        result TEXT,
        error TEXT,
        PRIMARY KEY (workflow_id, step_number),
        FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS alerts (
        id TEXT PRIMARY KEY,
        alert_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        workflow_id TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS provider_health (
        provider_id TEXT PRIMARY KEY,
        score INTEGER NOT NULL,
        quarantine_until TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS control_requests (
        workflow_id TEXT PRIMARY KEY,
        request TEXT NOT NULL,
        requested_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runner_leases (
        workflow_id TEXT PRIMARY KEY,
        runner_id TEXT NOT NULL,
        heartbeat_at TEXT NOT NULL,
        FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflows_updated ON workflows(updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_alerts_workflow ON alerts(workflow_id, created_at DESC);
";

const WORKFLOW_COLUMNS: &str = "id, workflow_type, status, project, request, parameters, \
     current_step, total_steps, progress_percent, created_at, started_at, paused_at, \
     completed_at, failed_at, cancelled_at, updated_at, error, result";

const STEP_COLUMNS: &str = "workflow_id, step_number, title, agent_id, status, started_at, \
     completed_at, duration_ms, result, error";

const ACTIVE_FILTER: &str = "status IN ('pending', 'running', 'paused')";
const TERMINAL_FILTER: &str = "status IN ('completed', 'failed', 'cancelled')";

/// SQLite-backed [`WorkflowStore`] and [`HealthStore`].
///
/// A fresh connection is opened per call on the blocking pool, so concurrent
/// workflow tasks never share a connection or hold a lock across calls.
pub struct SqliteWorkflowStore {
    db_path: PathBuf,
    migration: MigrationReport,
}

impl SqliteWorkflowStore {
    /// Open (or create) the database, initialize the schema, and run the
    /// one-time legacy cache migration if it has not completed yet.
    pub async fn open(
        db_path: impl Into<PathBuf>,
        legacy_cache: Option<PathBuf>,
    ) -> ConductorResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let path = db_path.clone();
        let migration = run_blocking(move || {
            let mut conn = connect(&path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(sql_err)?;
            conn.execute_batch(SCHEMA).map_err(sql_err)?;
            migration::run_once(&mut conn, legacy_cache.as_deref())
        })
        .await?;

        info!(
            db = %db_path.display(),
            migrated = migration.ran,
            workflows = migration.workflows,
            skipped = migration.skipped,
            "Workflow store opened"
        );

        Ok(Self { db_path, migration })
    }

    /// What the legacy cache migration did when this store was opened.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, f: F) -> ConductorResult<T>
    where
        F: FnOnce(&mut Connection) -> ConductorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        run_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await
    }

    async fn query_workflows(
        &self,
        sql: String,
        args: Vec<String>,
    ) -> ConductorResult<Vec<Workflow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), WorkflowRow::read)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows.into_iter().map(WorkflowRow::into_workflow).collect()
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> ConductorResult<T>
where
    F: FnOnce() -> ConductorResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConductorError::Persistence(format!("store task failed: {e}")))?
}

fn connect(path: &Path) -> ConductorResult<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        ConductorError::Persistence(format!("sqlite open failed at {}: {e}", path.display()))
    })?;
    conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(sql_err)?;
    Ok(conn)
}

pub(crate) fn sql_err(e: rusqlite::Error) -> ConductorError {
    ConductorError::Persistence(e.to_string())
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(raw: &str) -> ConductorResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ConductorError::Persistence(format!("invalid timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> ConductorResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> ConductorResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ConductorError::Persistence(format!("invalid id {raw:?}: {e}")))
}

/// Stored enum text must parse; a bad value is a corrupt row, not a caller error.
fn parse_enum<T>(raw: &str) -> ConductorResult<T>
where
    T: std::str::FromStr<Err = ConductorError>,
{
    raw.parse::<T>().map_err(|e| ConductorError::Persistence(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> ConductorResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json_opt(raw: Option<String>) -> ConductorResult<Option<ParamValue>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| ConductorError::Persistence(format!("invalid stored value: {e}")))
}

// --- Upserts (shared with the migration transaction) ---

// INSERT OR REPLACE would delete the old row first and cascade to its steps.
// A terminal row only accepts a re-save of the same status.
pub(crate) fn upsert_workflow(conn: &Connection, wf: &Workflow) -> ConductorResult<()> {
    wf.validate()?;
    let changed = conn.execute(
        "INSERT INTO workflows (
            id, workflow_type, status, project, request, parameters,
            current_step, total_steps, progress_percent, created_at, started_at, paused_at,
            completed_at, failed_at, cancelled_at, updated_at, error, result
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        ON CONFLICT(id) DO UPDATE SET
            workflow_type = excluded.workflow_type,
            status = excluded.status,
            project = excluded.project,
            request = excluded.request,
            parameters = excluded.parameters,
            current_step = excluded.current_step,
            total_steps = excluded.total_steps,
            progress_percent = excluded.progress_percent,
            started_at = excluded.started_at,
            paused_at = excluded.paused_at,
            completed_at = excluded.completed_at,
            failed_at = excluded.failed_at,
            cancelled_at = excluded.cancelled_at,
            updated_at = excluded.updated_at,
            error = excluded.error,
            result = excluded.result
        WHERE workflows.status NOT IN ('completed', 'failed', 'cancelled')
            OR workflows.status = excluded.status",
        params![
            wf.id.to_string(),
            wf.workflow_type.as_str(),
            wf.status.as_str(),
            wf.project,
            wf.request,
            to_json(&wf.parameters)?,
            wf.current_step,
            wf.total_steps,
            wf.progress_percent,
            ts(&wf.created_at),
            opt_ts(&wf.started_at),
            opt_ts(&wf.paused_at),
            opt_ts(&wf.completed_at),
            opt_ts(&wf.failed_at),
            opt_ts(&wf.cancelled_at),
            ts(&wf.updated_at),
            wf.error,
            wf.result.as_ref().map(to_json).transpose()?,
        ],
    )
    .map_err(sql_err)?;
    if changed == 0 {
        let stored: String = conn
            .query_row(
                "SELECT status FROM workflows WHERE id = ?1",
                params![wf.id.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        debug!(workflow_id = %wf.id, stored = %stored, "refused to overwrite finished workflow");
        return Err(ConductorError::invalid_transition(stored, wf.status));
    }
    Ok(())
}

pub(crate) fn upsert_step(conn: &Connection, step: &Step) -> ConductorResult<()> {
    if step.step_number == 0 {
        return Err(ConductorError::Validation(format!(
            "step numbers are 1-based (workflow {})",
            step.workflow_id
        )));
    }
    conn.execute(
        "INSERT INTO workflow_steps (
            workflow_id, step_number, title, agent_id, status, started_at,
            completed_at, duration_ms, result, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(workflow_id, step_number) DO UPDATE SET
            title = excluded.title,
            agent_id = excluded.agent_id,
            status = excluded.status,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            duration_ms = excluded.duration_ms,
            result = excluded.result,
            error = excluded.error",
        params![
            step.workflow_id.to_string(),
            step.step_number,
            step.title,
            step.agent_id,
            step.status.as_str(),
            ts(&step.started_at),
            opt_ts(&step.completed_at),
            step.duration_ms.map(|d| d as i64),
            step.result.as_ref().map(to_json).transpose()?,
            step.error,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ConductorError::Persistence(format!(
                "step {} references unknown workflow {}",
                step.step_number, step.workflow_id
            ))
        }
        other => sql_err(other),
    })?;
    Ok(())
}

pub(crate) fn upsert_alert(conn: &Connection, alert: &Alert) -> ConductorResult<()> {
    conn.execute(
        "INSERT INTO alerts (id, alert_type, severity, title, message, workflow_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            alert_type = excluded.alert_type,
            severity = excluded.severity,
            title = excluded.title,
            message = excluded.message,
            workflow_id = excluded.workflow_id",
        params![
            alert.id.to_string(),
            alert.alert_type.as_str(),
            alert.severity.as_str(),
            alert.title,
            alert.message,
            alert.workflow_id.map(|id| id.to_string()),
            ts(&alert.created_at),
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

// --- Row codecs ---

struct WorkflowRow {
    id: String,
    workflow_type: String,
    status: String,
    project: Option<String>,
    request: String,
    parameters: String,
    current_step: u32,
    total_steps: u32,
    progress_percent: u8,
    created_at: String,
    started_at: Option<String>,
    paused_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
    cancelled_at: Option<String>,
    updated_at: String,
    error: Option<String>,
    result: Option<String>,
}

impl WorkflowRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_type: row.get(1)?,
            status: row.get(2)?,
            project: row.get(3)?,
            request: row.get(4)?,
            parameters: row.get(5)?,
            current_step: row.get(6)?,
            total_steps: row.get(7)?,
            progress_percent: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            paused_at: row.get(11)?,
            completed_at: row.get(12)?,
            failed_at: row.get(13)?,
            cancelled_at: row.get(14)?,
            updated_at: row.get(15)?,
            error: row.get(16)?,
            result: row.get(17)?,
        })
    }

    fn into_workflow(self) -> ConductorResult<Workflow> {
        let parameters: Parameters = serde_json::from_str(&self.parameters)
            .map_err(|e| ConductorError::Persistence(format!("invalid parameters: {e}")))?;
        let workflow = Workflow {
            id: parse_uuid(&self.id)?,
            workflow_type: parse_enum(&self.workflow_type)?,
            status: parse_enum(&self.status)?,
            project: self.project,
            request: self.request,
            parameters,
            current_step: self.current_step,
            total_steps: self.total_steps,
            progress_percent: self.progress_percent,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            paused_at: parse_opt_ts(self.paused_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            failed_at: parse_opt_ts(self.failed_at)?,
            cancelled_at: parse_opt_ts(self.cancelled_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            error: self.error,
            result: from_json_opt(self.result)?,
        };
        workflow
            .validate()
            .map_err(|e| ConductorError::Persistence(e.to_string()))?;
        Ok(workflow)
    }
}

struct StepRow {
    workflow_id: String,
    step_number: u32,
    title: String,
    agent_id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    result: Option<String>,
    error: Option<String>,
}

impl StepRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workflow_id: row.get(0)?,
            step_number: row.get(1)?,
            title: row.get(2)?,
            agent_id: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            duration_ms: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
        })
    }

    fn into_step(self) -> ConductorResult<Step> {
        Ok(Step {
            workflow_id: parse_uuid(&self.workflow_id)?,
            step_number: self.step_number,
            title: self.title,
            agent_id: self.agent_id,
            status: parse_enum(&self.status)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            result: from_json_opt(self.result)?,
            error: self.error,
        })
    }
}

type AlertRow = (String, String, String, String, String, Option<String>, String);

fn read_alert(row: &Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn alert_from_row(
    (id, alert_type, severity, title, message, workflow_id, created_at): AlertRow,
) -> ConductorResult<Alert> {
    Ok(Alert {
        id: parse_uuid(&id)?,
        alert_type: parse_enum(&alert_type)?,
        severity: parse_enum(&severity)?,
        title,
        message,
        workflow_id: workflow_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow(&self, workflow: &Workflow) -> ConductorResult<()> {
        let wf = workflow.clone();
        debug!(workflow_id = %wf.id, status = %wf.status, progress = wf.progress_percent, "Saving workflow");
        self.with_conn(move |conn| upsert_workflow(conn, &wf)).await
    }

    async fn get_workflow(&self, id: Uuid) -> ConductorResult<Option<Workflow>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                    params![id.to_string()],
                    WorkflowRow::read,
                )
                .optional()
                .map_err(sql_err)?;
            row.map(WorkflowRow::into_workflow).transpose()
        })
        .await
    }

    async fn list_active(&self) -> ConductorResult<Vec<Workflow>> {
        self.query_workflows(
            format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE {ACTIVE_FILTER} \
                 ORDER BY created_at ASC, id ASC"
            ),
            Vec::new(),
        )
        .await
    }

    async fn list_history(&self, page: u32, page_size: u32) -> ConductorResult<Vec<Workflow>> {
        let offset = u64::from(page) * u64::from(page_size);
        self.query_workflows(
            format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE {TERMINAL_FILTER} \
                 ORDER BY updated_at DESC, id ASC LIMIT {page_size} OFFSET {offset}"
            ),
            Vec::new(),
        )
        .await
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> ConductorResult<Vec<Workflow>> {
        self.query_workflows(
            format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = ?1 \
                 ORDER BY created_at ASC, id ASC"
            ),
            vec![status.as_str().to_string()],
        )
        .await
    }

    async fn save_step(&self, step: &Step) -> ConductorResult<()> {
        let step = step.clone();
        self.with_conn(move |conn| upsert_step(conn, &step)).await
    }

    async fn list_steps(&self, workflow_id: Uuid) -> ConductorResult<Vec<Step>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ?1 \
                     ORDER BY step_number ASC"
                ))
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![workflow_id.to_string()], StepRow::read)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows.into_iter().map(StepRow::into_step).collect()
        })
        .await
    }

    async fn save_alert(&self, alert: &Alert) -> ConductorResult<()> {
        let alert = alert.clone();
        self.with_conn(move |conn| upsert_alert(conn, &alert)).await
    }

    async fn list_alerts(
        &self,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> ConductorResult<Vec<Alert>> {
        self.with_conn(move |conn| {
            let base = "SELECT id, alert_type, severity, title, message, workflow_id, created_at \
                        FROM alerts";
            let rows = match workflow_id {
                Some(id) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "{base} WHERE workflow_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                        ))
                        .map_err(sql_err)?;
                    let rows = stmt
                        .query_map(params![id.to_string(), limit as i64], read_alert)
                        .map_err(sql_err)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(sql_err)?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!("{base} ORDER BY created_at DESC LIMIT ?1"))
                        .map_err(sql_err)?;
                    let rows = stmt
                        .query_map(params![limit as i64], read_alert)
                        .map_err(sql_err)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(sql_err)?;
                    rows
                }
            };
            rows.into_iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn request_control(
        &self,
        workflow_id: Uuid,
        request: ControlRequest,
    ) -> ConductorResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO control_requests (workflow_id, request, requested_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(workflow_id) DO UPDATE SET
                    request = excluded.request,
                    requested_at = excluded.requested_at",
                params![workflow_id.to_string(), request.as_str(), ts(&Utc::now())],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn take_control(&self, workflow_id: Uuid) -> ConductorResult<Option<ControlRequest>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT request FROM control_requests WHERE workflow_id = ?1",
                    params![workflow_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            if raw.is_some() {
                tx.execute(
                    "DELETE FROM control_requests WHERE workflow_id = ?1",
                    params![workflow_id.to_string()],
                )
                .map_err(sql_err)?;
            }
            tx.commit().map_err(sql_err)?;
            raw.as_deref().map(parse_enum).transpose()
        })
        .await
    }

    async fn claim_runner(
        &self,
        workflow_id: Uuid,
        runner_id: Uuid,
        lease: Duration,
    ) -> ConductorResult<bool> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| ConductorError::Validation(format!("runner lease out of range: {e}")))?;
        self.with_conn(move |conn| {
            let now = Utc::now();
            let changed = conn
                .execute(
                    "INSERT INTO runner_leases (workflow_id, runner_id, heartbeat_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(workflow_id) DO UPDATE SET
                        runner_id = excluded.runner_id,
                        heartbeat_at = excluded.heartbeat_at
                    WHERE runner_leases.runner_id = excluded.runner_id
                        OR runner_leases.heartbeat_at < ?4",
                    params![
                        workflow_id.to_string(),
                        runner_id.to_string(),
                        ts(&now),
                        ts(&(now - lease)),
                    ],
                )
                .map_err(sql_err)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn renew_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE runner_leases SET heartbeat_at = ?3
                    WHERE workflow_id = ?1 AND runner_id = ?2",
                    params![
                        workflow_id.to_string(),
                        runner_id.to_string(),
                        ts(&Utc::now())
                    ],
                )
                .map_err(sql_err)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release_runner(&self, workflow_id: Uuid, runner_id: Uuid) -> ConductorResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM runner_leases WHERE workflow_id = ?1 AND runner_id = ?2",
                params![workflow_id.to_string(), runner_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl HealthStore for SqliteWorkflowStore {
    async fn load_health(&self) -> ConductorResult<Vec<ProviderHealth>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT provider_id, score, quarantine_until, updated_at \
                     FROM provider_health ORDER BY provider_id",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows.into_iter()
                .map(|(provider_id, score, quarantine_until, updated_at)| {
                    Ok(ProviderHealth {
                        provider_id,
                        score: score.clamp(0, 100) as u8,
                        quarantine_until: parse_opt_ts(quarantine_until)?,
                        updated_at: parse_ts(&updated_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn save_health(&self, health: &ProviderHealth) -> ConductorResult<()> {
        let health = health.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_health (provider_id, score, quarantine_until, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(provider_id) DO UPDATE SET
                    score = excluded.score,
                    quarantine_until = excluded.quarantine_until,
                    updated_at = excluded.updated_at
                WHERE excluded.updated_at >= provider_health.updated_at",
                params![
                    health.provider_id,
                    health.score,
                    opt_ts(&health.quarantine_until),
                    ts(&health.updated_at),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn record_alert(&self, alert: &Alert) -> ConductorResult<()> {
        self.save_alert(alert).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{NewWorkflow, WorkflowType};

    async fn temp_store() -> (SqliteWorkflowStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteWorkflowStore::open(tmp.path().join("conductor.db"), None)
            .await
            .unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:10.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(ts(&early) < ts(&late));
    }

    #[tokio::test]
    async fn test_corrupt_status_is_a_persistence_error() {
        let (store, _tmp) = temp_store().await;
        let wf = Workflow::new(NewWorkflow::new(WorkflowType::BugFix, "Fix crash"));
        store.save_workflow(&wf).await.unwrap();

        let id = wf.id;
        store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE workflows SET status = 'stalled' WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(sql_err)?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get_workflow(id).await.unwrap_err();
        assert!(matches!(err, ConductorError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_invalid_workflow_rejected_before_write() {
        let (store, _tmp) = temp_store().await;
        let mut wf = Workflow::new(NewWorkflow::new(WorkflowType::CodeReview, "Review"));
        wf.current_step = 10;
        let err = store.save_workflow(&wf).await.unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
        assert!(store.get_workflow(wf.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_zero_rejected() {
        let (store, _tmp) = temp_store().await;
        let wf = Workflow::new(NewWorkflow::new(WorkflowType::CodeReview, "Review"));
        store.save_workflow(&wf).await.unwrap();
        let step = Step::started(wf.id, 0, "Bad", "analyst");
        assert!(store.save_step(&step).await.is_err());
    }
}
