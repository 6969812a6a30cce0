use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ── Status enums ──────────────────────────────────────────────────────────────

/// Local status of a run.
///
/// Engine statuses the mapper does not know are carried verbatim in
/// [`DomainStatus::Other`] so new engine states degrade gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DomainStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl DomainStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DomainStatus::Queued => "queued",
            DomainStatus::Running => "running",
            DomainStatus::Cancelling => "cancelling",
            DomainStatus::Completed => "completed",
            DomainStatus::Failed => "failed",
            DomainStatus::Cancelled => "cancelled",
            DomainStatus::Other(s) => s,
        }
    }

    /// Parse a stored status string. Unknown strings become `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => DomainStatus::Queued,
            "running" => DomainStatus::Running,
            "cancelling" => DomainStatus::Cancelling,
            "completed" => DomainStatus::Completed,
            "failed" => DomainStatus::Failed,
            "cancelled" => DomainStatus::Cancelled,
            other => DomainStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DomainStatus::Completed | DomainStatus::Failed | DomainStatus::Cancelled
        )
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DomainStatus {
    fn from(s: String) -> Self {
        DomainStatus::parse(&s)
    }
}

impl From<DomainStatus> for String {
    fn from(s: DomainStatus) -> Self {
        s.as_str().to_string()
    }
}

/// Latest known state of one step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Started,
    Success,
    Failure,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Started => "STARTED",
            StepState::Success => "SUCCESS",
            StepState::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTED" => Some(StepState::Started),
            "SUCCESS" => Some(StepState::Success),
            "FAILURE" => Some(StepState::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Started)
    }
}

/// Kind of engine event a log entry was derived from.
///
/// Variants are declared in the alphabetical order of their wire strings, so
/// `Ord` matches how SQL backends sort the stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Message,
    StepFailure,
    StepInput,
    StepOutput,
    StepStart,
    StepSuccess,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "MESSAGE",
            EventKind::StepStart => "STEP_START",
            EventKind::StepSuccess => "STEP_SUCCESS",
            EventKind::StepFailure => "STEP_FAILURE",
            EventKind::StepInput => "STEP_INPUT",
            EventKind::StepOutput => "STEP_OUTPUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MESSAGE" => Some(EventKind::Message),
            "STEP_START" => Some(EventKind::StepStart),
            "STEP_SUCCESS" => Some(EventKind::StepSuccess),
            "STEP_FAILURE" => Some(EventKind::StepFailure),
            "STEP_INPUT" => Some(EventKind::StepInput),
            "STEP_OUTPUT" => Some(EventKind::StepOutput),
            _ => None,
        }
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Lenient parse of an engine or stored level; unknown levels are `Info`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            "CRITICAL" | "FATAL" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

// ── Output locations ─────────────────────────────────────────────────────────

/// One resolved output file location of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named output path template declared by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputTemplate {
    pub name: String,
    /// Usually a string like `"out/{workflow_id}.json"`, but may be any JSON
    /// document whose string leaves contain placeholders.
    pub path_template: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

/// How a workflow declares where its runs write output files.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputPathSpec {
    Templates { templates: Vec<OutputTemplate> },
    /// Legacy single `path_pattern`.
    Pattern { pattern: String },
    #[default]
    Absent,
}

impl OutputPathSpec {
    /// Build from the two workflow columns: named templates win over the
    /// legacy pattern, and empty values count as absent.
    pub fn from_parts(templates: Option<Vec<OutputTemplate>>, pattern: Option<String>) -> Self {
        match (templates, pattern) {
            (Some(templates), _) if !templates.is_empty() => {
                OutputPathSpec::Templates { templates }
            }
            (_, Some(pattern)) if !pattern.trim().is_empty() => OutputPathSpec::Pattern { pattern },
            _ => OutputPathSpec::Absent,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Local snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub external_run_id: String,
    pub workflow_id: i64,
    pub status: DomainStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub output_locations: Vec<OutputLocation>,
    pub run_config: serde_json::Value,
}

/// A run as recorded by the launch path, before any sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub external_run_id: String,
    pub workflow_id: i64,
    pub status: DomainStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub run_config: serde_json::Value,
}

/// Fields to change on a run. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<DomainStatus>,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    /// Overrides the duration computed from `started_at`/`finished_at`.
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub output_locations: Option<Vec<OutputLocation>>,
    pub run_config: Option<serde_json::Value>,
}

/// A step state change derived from one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    pub step_code: String,
    pub status: StepState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

/// Latest known state of one (run, step code) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusRecord {
    pub run_id: i64,
    pub external_run_id: String,
    pub step_code: String,
    pub status: StepState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
}

/// A log line derived from one engine event.
///
/// Unique per (external run id, event kind, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryRecord {
    pub run_id: i64,
    pub external_run_id: String,
    pub step_code: Option<String>,
    pub event_kind: EventKind,
    pub message: String,
    pub level: LogLevel,
    /// Engine clock time of the event, not ingestion time.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The raw event, stored verbatim.
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_status_round_trips_through_strings() {
        for status in [
            DomainStatus::Queued,
            DomainStatus::Running,
            DomainStatus::Cancelling,
            DomainStatus::Completed,
            DomainStatus::Failed,
            DomainStatus::Cancelled,
            DomainStatus::Other("MANAGED".into()),
        ] {
            assert_eq!(DomainStatus::parse(status.as_str()), status);
        }
        assert_eq!(
            serde_json::to_value(DomainStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(DomainStatus::Completed.is_terminal());
        assert!(DomainStatus::Cancelled.is_terminal());
        assert!(!DomainStatus::Cancelling.is_terminal());
        assert!(!DomainStatus::Other("MANAGED".into()).is_terminal());
        assert!(StepState::Failure.is_terminal());
        assert!(!StepState::Started.is_terminal());
    }

    #[test]
    fn log_level_parse_is_lenient() {
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse("something"), LogLevel::Info);
    }

    #[test]
    fn output_path_spec_from_parts() {
        let template = OutputTemplate {
            name: "report".into(),
            path_template: serde_json::json!("out/{run_uuid}.csv"),
            description: None,
        };
        assert!(matches!(
            OutputPathSpec::from_parts(Some(vec![template]), Some("legacy".into())),
            OutputPathSpec::Templates { .. }
        ));
        assert!(matches!(
            OutputPathSpec::from_parts(Some(vec![]), Some("legacy/{batch_name}".into())),
            OutputPathSpec::Pattern { .. }
        ));
        assert_eq!(
            OutputPathSpec::from_parts(None, Some("  ".into())),
            OutputPathSpec::Absent
        );
    }
}
