//! Conflict-resolution rules shared by every backend.
//!
//! Backends read the current row (under a lock, inside the snapshot), apply
//! these pure functions, and write the result back. Keeping the rules here
//! means the in-memory and SQL backends cannot drift apart.

use time::OffsetDateTime;

use crate::record::{RunRecord, RunUpdate, StepState, StepStatusRecord, StepTransition};

/// Seconds between two instants, when both are known.
pub fn duration_between(
    started_at: Option<OffsetDateTime>,
    finished_at: Option<OffsetDateTime>,
) -> Option<f64> {
    match (started_at, finished_at) {
        (Some(start), Some(end)) => Some((end - start).as_seconds_f64()),
        _ => None,
    }
}

/// Whether a step in state `current` may move to `incoming`.
///
/// STARTED never overwrites a terminal state, and a FAILURE is never
/// overwritten by a SUCCESS.
pub fn step_transition_allowed(current: StepState, incoming: StepState) -> bool {
    !matches!(
        (current, incoming),
        (StepState::Success | StepState::Failure, StepState::Started)
            | (StepState::Failure, StepState::Success)
    )
}

/// Apply a transition to the stored state of a step (or to nothing, for the
/// first event of the step).
///
/// Timestamps are only ever set, never cleared: a `None` in the transition
/// keeps the stored value. A rejected transition still fills a missing
/// `started_at`, so an out-of-order STARTED arriving after the terminal
/// event completes the row without changing its status.
pub fn apply_step_transition(
    existing: Option<&StepStatusRecord>,
    run_id: i64,
    external_run_id: &str,
    transition: &StepTransition,
) -> StepStatusRecord {
    let mut next = match existing {
        Some(current) => current.clone(),
        None => StepStatusRecord {
            run_id,
            external_run_id: external_run_id.to_string(),
            step_code: transition.step_code.clone(),
            status: transition.status,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            error_message: None,
        },
    };

    let allowed = existing.map_or(true, |current| {
        step_transition_allowed(current.status, transition.status)
    });

    if !allowed {
        if transition.status == StepState::Started && next.started_at.is_none() {
            next.started_at = transition.started_at;
            next.duration_seconds = duration_between(next.started_at, next.finished_at);
        }
        return next;
    }

    next.status = transition.status;
    next.started_at = transition.started_at.or(next.started_at);
    match transition.status {
        StepState::Started => {}
        StepState::Success => {
            next.finished_at = transition.finished_at.or(next.finished_at);
        }
        StepState::Failure => {
            next.finished_at = transition.finished_at.or(next.finished_at);
            next.error_message = transition.error_message.clone().or(next.error_message);
        }
    }
    next.duration_seconds =
        duration_between(next.started_at, next.finished_at).or(next.duration_seconds);
    next
}

/// Apply an update to a run.
///
/// A run that is already terminal keeps its status, `finished_at` and
/// duration. `finished_at` and duration are only written on the update that
/// first makes the run terminal. Output locations are frozen once a terminal
/// run has any.
pub fn apply_run_update(existing: &RunRecord, update: &RunUpdate) -> RunRecord {
    let mut next = existing.clone();

    if next.started_at.is_none() {
        next.started_at = update.started_at;
    }

    if !existing.status.is_terminal() {
        if let Some(status) = &update.status {
            next.status = status.clone();
            if status.is_terminal() {
                next.finished_at = update.finished_at.or(existing.finished_at);
                next.duration_seconds = update
                    .duration_seconds
                    .or_else(|| duration_between(next.started_at, next.finished_at));
            }
        }
        if update.error_message.is_some() {
            next.error_message = update.error_message.clone();
        }
    } else if next.error_message.is_none() {
        next.error_message = update.error_message.clone();
    }

    let locations_frozen = existing.status.is_terminal() && !existing.output_locations.is_empty();
    if let Some(locations) = &update.output_locations {
        if !locations_frozen {
            next.output_locations = locations.clone();
        }
    }
    if let Some(config) = &update.run_config {
        next.run_config = config.clone();
    }
    next
}
