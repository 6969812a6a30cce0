use sqlx::postgres::PgRow;
use sqlx::Row;

use runsync_storage::{
    DomainStatus, EventKind, LogEntryRecord, LogLevel, RunRecord, StepState, StepStatusRecord,
    StorageError,
};

use crate::backend;

pub(crate) const RUN_COLUMNS: &str = "id, external_run_id, workflow_id, status, started_at, \
     finished_at, duration_seconds, error_message, output_locations, run_config";

pub(crate) const STEP_COLUMNS: &str = "run_id, external_run_id, step_code, status, started_at, \
     finished_at, duration_seconds, error_message";

pub(crate) const LOG_COLUMNS: &str =
    "run_id, external_run_id, step_code, event_type, message, level, logged_at, payload";

pub(crate) fn run_from_row(row: &PgRow) -> Result<RunRecord, StorageError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let locations: serde_json::Value = row.try_get("output_locations").map_err(backend)?;
    Ok(RunRecord {
        id: row.try_get("id").map_err(backend)?,
        external_run_id: row.try_get("external_run_id").map_err(backend)?,
        workflow_id: row.try_get("workflow_id").map_err(backend)?,
        status: DomainStatus::parse(&status),
        started_at: row.try_get("started_at").map_err(backend)?,
        finished_at: row.try_get("finished_at").map_err(backend)?,
        duration_seconds: row.try_get("duration_seconds").map_err(backend)?,
        error_message: row.try_get("error_message").map_err(backend)?,
        output_locations: serde_json::from_value(locations)?,
        run_config: row.try_get("run_config").map_err(backend)?,
    })
}

pub(crate) fn step_from_row(row: &PgRow) -> Result<StepStatusRecord, StorageError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let status = StepState::parse(&status)
        .ok_or_else(|| StorageError::Serialization(format!("unknown step status '{status}'")))?;
    Ok(StepStatusRecord {
        run_id: row.try_get("run_id").map_err(backend)?,
        external_run_id: row.try_get("external_run_id").map_err(backend)?,
        step_code: row.try_get("step_code").map_err(backend)?,
        status,
        started_at: row.try_get("started_at").map_err(backend)?,
        finished_at: row.try_get("finished_at").map_err(backend)?,
        duration_seconds: row.try_get("duration_seconds").map_err(backend)?,
        error_message: row.try_get("error_message").map_err(backend)?,
    })
}

pub(crate) fn log_from_row(row: &PgRow) -> Result<LogEntryRecord, StorageError> {
    let kind: String = row.try_get("event_type").map_err(backend)?;
    let event_kind = EventKind::parse(&kind)
        .ok_or_else(|| StorageError::Serialization(format!("unknown event type '{kind}'")))?;
    let level: String = row.try_get("level").map_err(backend)?;
    Ok(LogEntryRecord {
        run_id: row.try_get("run_id").map_err(backend)?,
        external_run_id: row.try_get("external_run_id").map_err(backend)?,
        step_code: row.try_get("step_code").map_err(backend)?,
        event_kind,
        message: row.try_get("message").map_err(backend)?,
        level: LogLevel::parse(&level),
        timestamp: row.try_get("logged_at").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
    })
}
