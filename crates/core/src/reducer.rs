//! Event reduction: one raw engine event in, at most one step transition and
//! one log entry out.
//!
//! Dispatch is over an allow-list of GraphQL typenames. Anything else is
//! [`EngineEventKind::Unknown`] and reduces to nothing.

use serde_json::Value;
use time::OffsetDateTime;

use runsync_engine::epoch_seconds;
use runsync_storage::{EventKind, LogEntryRecord, LogLevel, StepState, StepTransition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEvent {
    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("event has no __typename")]
    MissingTypename,
}

/// What an engine event reports.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    StepStart,
    StepSuccess,
    StepFailure {
        error: Option<String>,
    },
    StepInput {
        input_name: Option<String>,
        type_check_passed: Option<bool>,
    },
    StepOutput {
        output_name: Option<String>,
        type_check_passed: Option<bool>,
    },
    Message,
    Unknown(String),
}

/// A parsed engine event.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub kind: EngineEventKind,
    pub step_key: Option<String>,
    /// `None` when the engine sent no timestamp or one that does not parse.
    pub timestamp: Option<OffsetDateTime>,
    pub message: Option<String>,
    pub level: Option<String>,
    /// The event exactly as received.
    pub raw: Value,
}

impl EngineEvent {
    pub fn parse(raw: &Value) -> Result<Self, MalformedEvent> {
        let obj = raw.as_object().ok_or(MalformedEvent::NotAnObject)?;
        let typename = obj
            .get("__typename")
            .and_then(Value::as_str)
            .ok_or(MalformedEvent::MissingTypename)?;

        let kind = match typename {
            "ExecutionStepStartEvent" => EngineEventKind::StepStart,
            "ExecutionStepSuccessEvent" => EngineEventKind::StepSuccess,
            "ExecutionStepFailureEvent" => EngineEventKind::StepFailure {
                error: non_empty(raw.pointer("/error/message")),
            },
            "ExecutionStepInputEvent" => EngineEventKind::StepInput {
                input_name: non_empty(obj.get("inputName")),
                type_check_passed: raw.pointer("/typeCheck/success").and_then(Value::as_bool),
            },
            "ExecutionStepOutputEvent" => EngineEventKind::StepOutput {
                output_name: non_empty(obj.get("outputName")),
                type_check_passed: raw.pointer("/typeCheck/success").and_then(Value::as_bool),
            },
            "LogMessageEvent" | "MessageEvent" => EngineEventKind::Message,
            other => EngineEventKind::Unknown(other.to_string()),
        };

        Ok(Self {
            kind,
            step_key: non_empty(obj.get("stepKey")),
            timestamp: obj.get("timestamp").and_then(epoch_seconds),
            message: non_empty(obj.get("message")),
            level: non_empty(obj.get("level")),
            raw: raw.clone(),
        })
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// A log entry not yet bound to a stored run.
#[derive(Debug, Clone, PartialEq)]
pub struct LogDraft {
    pub step_code: Option<String>,
    pub event_kind: EventKind,
    pub message: String,
    pub level: LogLevel,
    pub timestamp: OffsetDateTime,
    pub payload: Value,
}

impl LogDraft {
    pub fn into_record(self, run_id: i64, external_run_id: &str) -> LogEntryRecord {
        LogEntryRecord {
            run_id,
            external_run_id: external_run_id.to_string(),
            step_code: self.step_code,
            event_kind: self.event_kind,
            message: self.message,
            level: self.level,
            timestamp: self.timestamp,
            payload: self.payload,
        }
    }
}

/// Everything one event contributes to local state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducedEffect {
    pub step_transition: Option<StepTransition>,
    pub log_entry: Option<LogDraft>,
}

/// Reduce one event. Pure: the same event always yields the same effect.
pub fn reduce(event: &EngineEvent) -> ReducedEffect {
    let step = event.step_key.as_deref().unwrap_or("?");
    let ts = event.timestamp;

    let (status, log) = match &event.kind {
        EngineEventKind::StepStart => (
            Some(StepState::Started),
            Some((
                EventKind::StepStart,
                LogLevel::Info,
                event
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Step '{step}' started")),
            )),
        ),
        EngineEventKind::StepSuccess => (
            Some(StepState::Success),
            Some((
                EventKind::StepSuccess,
                LogLevel::Info,
                event
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Step '{step}' succeeded")),
            )),
        ),
        EngineEventKind::StepOutput {
            output_name,
            type_check_passed,
        } => {
            let name = output_name.as_deref().unwrap_or("result");
            let (level, message) = if type_check_passed.unwrap_or(true) {
                (
                    LogLevel::Info,
                    format!("Step '{step}' yielded output '{name}'"),
                )
            } else {
                (
                    LogLevel::Error,
                    format!("Output '{name}' of step '{step}' failed its type check"),
                )
            };
            (
                Some(StepState::Success),
                Some((EventKind::StepOutput, level, message)),
            )
        }
        EngineEventKind::StepFailure { error } => {
            let message = error
                .clone()
                .or_else(|| event.message.clone())
                .unwrap_or_else(|| format!("Step '{step}' failed"));
            (
                Some(StepState::Failure),
                Some((EventKind::StepFailure, LogLevel::Error, message)),
            )
        }
        EngineEventKind::StepInput {
            input_name,
            type_check_passed,
        } => {
            let name = input_name.as_deref().unwrap_or("input");
            let (level, message) = if type_check_passed.unwrap_or(true) {
                (
                    LogLevel::Info,
                    format!("Input '{name}' of step '{step}' passed its type check"),
                )
            } else {
                (
                    LogLevel::Error,
                    format!("Input '{name}' of step '{step}' failed its type check"),
                )
            };
            (None, Some((EventKind::StepInput, level, message)))
        }
        EngineEventKind::Message => (
            None,
            Some((
                EventKind::Message,
                event
                    .level
                    .as_deref()
                    .map(LogLevel::parse)
                    .unwrap_or(LogLevel::Info),
                event.message.clone().unwrap_or_default(),
            )),
        ),
        EngineEventKind::Unknown(_) => (None, None),
    };

    let step_transition = match (status, &event.step_key) {
        (Some(status), Some(step_code)) => Some(StepTransition {
            step_code: step_code.clone(),
            status,
            started_at: if status == StepState::Started { ts } else { None },
            finished_at: if status.is_terminal() { ts } else { None },
            error_message: match &event.kind {
                EngineEventKind::StepFailure { .. } => log.as_ref().map(|(_, _, m)| m.clone()),
                _ => None,
            },
        }),
        _ => None,
    };

    // The timestamp is part of the log's identity; without one there is
    // nothing to deduplicate on.
    let log_entry = match (log, ts) {
        (Some((event_kind, level, message)), Some(timestamp)) => Some(LogDraft {
            step_code: event.step_key.clone(),
            event_kind,
            message,
            level,
            timestamp,
            payload: event.raw.clone(),
        }),
        _ => None,
    };

    ReducedEffect {
        step_transition,
        log_entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> EngineEvent {
        EngineEvent::parse(&v).unwrap()
    }

    fn secs(ts: Option<OffsetDateTime>) -> Option<i64> {
        ts.map(|t| t.unix_timestamp())
    }

    #[test]
    fn step_start_sets_started_at_only() {
        let effect = reduce(&parse(json!({
            "__typename": "ExecutionStepStartEvent",
            "stepKey": "load",
            "timestamp": "100",
            "message": "Started execution of step \"load\".",
            "level": "DEBUG",
        })));
        let t = effect.step_transition.unwrap();
        assert_eq!(t.status, StepState::Started);
        assert_eq!(secs(t.started_at), Some(100));
        assert_eq!(t.finished_at, None);
        let log = effect.log_entry.unwrap();
        assert_eq!(log.event_kind, EventKind::StepStart);
        assert_eq!(log.level, LogLevel::Info);
        assert_eq!(log.message, "Started execution of step \"load\".");
    }

    #[test]
    fn failure_carries_error_message() {
        let effect = reduce(&parse(json!({
            "__typename": "ExecutionStepFailureEvent",
            "stepKey": "x",
            "timestamp": 20.5,
            "message": "Execution of step \"x\" failed.",
            "error": {"message": "boom"},
        })));
        let t = effect.step_transition.unwrap();
        assert_eq!(t.status, StepState::Failure);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
        assert_eq!(secs(t.finished_at), Some(20));
        let log = effect.log_entry.unwrap();
        assert_eq!(log.level, LogLevel::Error);
        assert_eq!(log.message, "boom");
    }

    #[test]
    fn output_type_check_failure_logs_error_but_still_succeeds() {
        let effect = reduce(&parse(json!({
            "__typename": "ExecutionStepOutputEvent",
            "stepKey": "x",
            "timestamp": 5,
            "outputName": "rows",
            "typeCheck": {"success": false},
        })));
        assert_eq!(effect.step_transition.unwrap().status, StepState::Success);
        let log = effect.log_entry.unwrap();
        assert_eq!(log.event_kind, EventKind::StepOutput);
        assert_eq!(log.level, LogLevel::Error);
    }

    #[test]
    fn input_and_message_events_only_log() {
        let input = reduce(&parse(json!({
            "__typename": "ExecutionStepInputEvent",
            "stepKey": "x",
            "timestamp": 5,
            "inputName": "df",
            "typeCheck": {"success": true},
        })));
        assert!(input.step_transition.is_none());
        assert_eq!(
            input.log_entry.unwrap().message,
            "Input 'df' of step 'x' passed its type check"
        );

        let message = reduce(&parse(json!({
            "__typename": "LogMessageEvent",
            "timestamp": 6,
            "level": "WARNING",
            "message": "disk almost full",
        })));
        assert!(message.step_transition.is_none());
        let log = message.log_entry.unwrap();
        assert_eq!(log.level, LogLevel::Warning);
        assert_eq!(log.step_code, None);
        assert_eq!(log.message, "disk almost full");
    }

    #[test]
    fn unknown_typename_reduces_to_nothing() {
        let effect = reduce(&parse(json!({
            "__typename": "AssetMaterializationPlannedEvent",
            "stepKey": "x",
            "timestamp": 1,
        })));
        assert_eq!(effect, ReducedEffect::default());
    }

    #[test]
    fn missing_step_key_means_no_transition() {
        let effect = reduce(&parse(json!({
            "__typename": "ExecutionStepSuccessEvent",
            "timestamp": 1,
        })));
        assert!(effect.step_transition.is_none());
        assert!(effect.log_entry.is_some());
    }

    #[test]
    fn unparseable_timestamp_drops_log_but_keeps_transition() {
        let effect = reduce(&parse(json!({
            "__typename": "ExecutionStepSuccessEvent",
            "stepKey": "x",
            "timestamp": "soon",
        })));
        let t = effect.step_transition.unwrap();
        assert_eq!(t.finished_at, None);
        assert!(effect.log_entry.is_none());
    }

    #[test]
    fn malformed_events_are_rejected() {
        assert_eq!(
            EngineEvent::parse(&json!("text")),
            Err(MalformedEvent::NotAnObject)
        );
        assert_eq!(
            EngineEvent::parse(&json!({"stepKey": "x"})),
            Err(MalformedEvent::MissingTypename)
        );
    }

    #[test]
    fn draft_binds_to_run() {
        let draft = reduce(&parse(json!({
            "__typename": "MessageEvent",
            "timestamp": 1,
            "message": "hi",
        })))
        .log_entry
        .unwrap();
        let record = draft.into_record(3, "abc");
        assert_eq!(record.run_id, 3);
        assert_eq!(record.external_run_id, "abc");
        assert_eq!(record.payload["message"], json!("hi"));
    }
}
