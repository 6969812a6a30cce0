//! Sync orchestration: candidate selection, per-run sync, cursor bookkeeping.
//!
//! Two entry points share one per-run routine ([`SyncOrchestrator::sync_run`]):
//! the periodic [`SyncOrchestrator::tick`] and on-demand
//! [`SyncOrchestrator::trigger_sync`]. Every run is persisted in its own
//! snapshot, so overlapping ticks and triggers collapse into idempotent
//! upserts.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use runsync_engine::{EngineError, ExecutionEngine, RunSummary};
use runsync_storage::{DomainStatus, OutputLocation, RunUpdate, StepState, SyncStorage};

use crate::error::SyncError;
use crate::gateway::{persist_run, RunPersistPlan};
use crate::output_paths::resolve_at;
use crate::reducer::{reduce, EngineEvent};
use crate::status::{is_success_terminal, map_status};

/// Growth bound for a page re-requested because every run in it shares one
/// update time.
const MAX_PAGE_WIDENING: usize = 64;

/// Source of "now". Injected so tests can pin time.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Tunables for the periodic pass.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Number of recently updated runs requested per engine call.
    pub page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

/// What one successful per-run sync did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSyncSummary {
    pub external_run_id: String,
    pub status: DomainStatus,
    pub output_locations: Vec<OutputLocation>,
    pub step_transitions: usize,
    pub log_entries: usize,
    /// Events that could not be parsed and were skipped.
    pub dropped_events: usize,
}

/// Result of [`SyncOrchestrator::sync_run`] when no error occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Synced(RunSyncSummary),
    /// The engine has no run with this id.
    EngineRunMissing,
    /// The engine knows the run but it was never recorded locally.
    LocalRunMissing,
}

/// Response of an on-demand sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerResponse {
    Synced {
        success: bool,
        status: String,
        output_locations: Vec<OutputLocation>,
        log_count: usize,
    },
    NotFound {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Summary of one periodic pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub candidates: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cursor_before: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cursor_after: Option<OffsetDateTime>,
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidate(s): {} synced, {} skipped, {} failed",
            self.candidates, self.synced, self.skipped, self.failed
        )?;
        match (self.cursor_before, self.cursor_after) {
            (before, after) if before == after => write!(f, "; cursor unchanged"),
            (_, Some(after)) => write!(f, "; cursor advanced to {after}"),
            (_, None) => Ok(()),
        }
    }
}

/// Compute the cursor after a tick.
///
/// The new cursor is the newest update time among runs handled without
/// error that is strictly older than every failed run's update time. It only
/// ever moves forward.
pub fn next_cursor(
    current: Option<OffsetDateTime>,
    handled: &[OffsetDateTime],
    failed: &[OffsetDateTime],
) -> Option<OffsetDateTime> {
    let barrier = failed.iter().min();
    let candidate = handled
        .iter()
        .filter(|ts| barrier.map_or(true, |b| *ts < b))
        .max()
        .copied();
    match (candidate, current) {
        (Some(c), Some(cur)) if c <= cur => Some(cur),
        (Some(c), _) => Some(c),
        (None, cur) => cur,
    }
}

/// Runs gathered for one tick.
struct CandidateSet {
    candidates: Vec<RunSummary>,
    /// Update time at which paging gave up; runs at or below it may be unseen.
    incomplete_at: Option<OffsetDateTime>,
}

/// Reconciles engine run history into the local store.
pub struct SyncOrchestrator<E, S> {
    engine: Arc<E>,
    storage: Arc<S>,
    settings: SyncSettings,
    clock: Clock,
}

impl<E, S> SyncOrchestrator<E, S>
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    pub fn new(engine: Arc<E>, storage: Arc<S>, settings: SyncSettings) -> Self {
        Self {
            engine,
            storage,
            settings,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static,
    ) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// One periodic pass over recently updated runs.
    ///
    /// Per-run failures are counted, not returned. An `Err` means the pass
    /// could not start or could not record its cursor.
    pub async fn tick(&self) -> Result<TickReport, SyncError> {
        let cursor_before = self.storage.load_cursor().await?;
        let CandidateSet {
            mut candidates,
            incomplete_at,
        } = self.collect_candidates(cursor_before).await?;
        candidates.sort_by(|a, b| b.update_time.cmp(&a.update_time));

        let mut report = TickReport {
            candidates: candidates.len(),
            synced: 0,
            skipped: 0,
            failed: 0,
            cursor_before,
            cursor_after: cursor_before,
        };
        let mut handled = Vec::with_capacity(candidates.len());
        let mut failed: Vec<OffsetDateTime> = incomplete_at.into_iter().collect();

        for candidate in &candidates {
            match self.sync_run(&candidate.run_id).await {
                Ok(RunOutcome::Synced(_)) => {
                    report.synced += 1;
                    handled.push(candidate.update_time);
                }
                Ok(RunOutcome::EngineRunMissing | RunOutcome::LocalRunMissing) => {
                    report.skipped += 1;
                    handled.push(candidate.update_time);
                }
                Err(e) => {
                    error!(run_id = %candidate.run_id, error = %e, "run sync failed");
                    report.failed += 1;
                    failed.push(candidate.update_time);
                }
            }
        }

        let cursor_after = next_cursor(cursor_before, &handled, &failed);
        if cursor_after != cursor_before {
            if let Some(cursor) = cursor_after {
                self.storage.store_cursor(cursor).await?;
            }
        }
        report.cursor_after = cursor_after;

        info!(
            candidates = report.candidates,
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed,
            "sync tick finished"
        );
        Ok(report)
    }

    /// Page through every run updated after `cursor`, newest first.
    ///
    /// Each full page is followed by a request bounded above by the oldest
    /// update time seen so far. A page holding nothing but runs at that bound
    /// is re-requested with a wider limit. Past [`MAX_PAGE_WIDENING`] the
    /// bound is reported so the cursor stays below it.
    async fn collect_candidates(
        &self,
        cursor: Option<OffsetDateTime>,
    ) -> Result<CandidateSet, SyncError> {
        let floor = cursor.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let page_size = self.settings.page_size.max(1);
        let mut limit = page_size;
        let mut before = None;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = self
                .engine
                .list_recently_updated_runs(limit, cursor, before)
                .await?;
            pages += 1;
            let full = page.len() >= limit;
            let oldest = page.iter().map(|r| r.update_time).min();
            for run in page {
                if run.update_time > floor && seen.insert(run.run_id.clone()) {
                    candidates.push(run);
                }
            }

            match oldest {
                Some(oldest) if full && before == Some(oldest) => {
                    if limit >= page_size.saturating_mul(MAX_PAGE_WIDENING) {
                        warn!(
                            limit,
                            update_time = %oldest,
                            "too many runs share one update time; holding the cursor below it"
                        );
                        return Ok(CandidateSet {
                            candidates,
                            incomplete_at: Some(oldest),
                        });
                    }
                    limit = limit.saturating_mul(2);
                }
                Some(oldest) if full => {
                    before = Some(oldest);
                    limit = page_size;
                }
                _ => break,
            }
        }

        if pages > 1 {
            debug!(pages, candidates = candidates.len(), "paged through run backlog");
        }
        Ok(CandidateSet {
            candidates,
            incomplete_at: None,
        })
    }

    /// Sync one run now, regardless of the cursor, which is left untouched.
    pub async fn trigger_sync(&self, external_run_id: &str) -> TriggerResponse {
        match self.sync_run(external_run_id).await {
            Ok(RunOutcome::Synced(summary)) => TriggerResponse::Synced {
                success: true,
                status: summary.status.to_string(),
                output_locations: summary.output_locations,
                log_count: summary.log_entries,
            },
            Ok(RunOutcome::EngineRunMissing) => TriggerResponse::NotFound {
                message: format!("run {external_run_id} not found in the execution engine"),
            },
            Ok(RunOutcome::LocalRunMissing) => TriggerResponse::NotFound {
                message: format!("run {external_run_id} is not recorded locally"),
            },
            Err(e) => {
                error!(run_id = %external_run_id, error = %e, "on-demand sync failed");
                TriggerResponse::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Fetch, reduce, resolve and persist one run.
    pub async fn sync_run(&self, external_run_id: &str) -> Result<RunOutcome, SyncError> {
        let detail = match self.engine.get_run_detail(external_run_id).await {
            Ok(detail) => detail,
            Err(EngineError::RunNotFound { .. }) => {
                warn!(run_id = %external_run_id, "run not found in engine; skipping");
                return Ok(RunOutcome::EngineRunMissing);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(run) = self.storage.find_run(external_run_id).await? else {
            warn!(run_id = %external_run_id, "run not recorded locally; skipping");
            return Ok(RunOutcome::LocalRunMissing);
        };

        let now = (self.clock)();
        let mut transitions = Vec::new();
        let mut logs = Vec::new();
        let mut dropped_events = 0;
        let mut first_failure: Option<String> = None;
        let mut latest_event: Option<OffsetDateTime> = None;

        for raw in &detail.events {
            let event = match EngineEvent::parse(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(run_id = %external_run_id, error = %e, "dropping malformed engine event");
                    dropped_events += 1;
                    continue;
                }
            };
            if let Some(ts) = event.timestamp {
                latest_event = latest_event.max(Some(ts));
            }

            let effect = reduce(&event);
            if let Some(transition) = effect.step_transition {
                if transition.status == StepState::Failure && first_failure.is_none() {
                    first_failure = Some(
                        transition
                            .error_message
                            .clone()
                            .unwrap_or_else(|| format!("step '{}' failed", transition.step_code)),
                    );
                }
                transitions.push(transition);
            }
            if let Some(draft) = effect.log_entry {
                logs.push(draft.into_record(run.id, external_run_id));
            }
        }

        let status = map_status(&detail.status);
        let config = if detail.config.is_null() {
            &run.run_config
        } else {
            &detail.config
        };

        // A finished run keeps the paths it was first resolved to.
        let locations_settled = run.status.is_terminal() && !run.output_locations.is_empty();
        let resolved = if is_success_terminal(&detail.status) && !locations_settled {
            let spec = self.storage.workflow_output_spec(run.workflow_id).await?;
            Some(resolve_at(config, &spec, now))
        } else {
            None
        };

        let finished_at = status
            .is_terminal()
            .then(|| detail.end_time.or(latest_event).unwrap_or(now));
        let update = RunUpdate {
            status: Some(status.clone()),
            started_at: detail.start_time,
            finished_at,
            duration_seconds: None,
            error_message: if status == DomainStatus::Failed {
                first_failure
            } else {
                None
            },
            output_locations: resolved.clone(),
            run_config: (!detail.config.is_null()).then(|| detail.config.clone()),
        };

        let summary = persist_run(
            self.storage.as_ref(),
            RunPersistPlan {
                run_id: run.id,
                external_run_id: external_run_id.to_string(),
                transitions,
                logs,
                update,
            },
        )
        .await?;

        debug!(
            run_id = %external_run_id,
            status = %status,
            steps = summary.step_transitions,
            logs = summary.log_entries,
            dropped_events,
            "run synced"
        );

        Ok(RunOutcome::Synced(RunSyncSummary {
            external_run_id: external_run_id.to_string(),
            status,
            output_locations: resolved.unwrap_or(run.output_locations),
            step_transitions: summary.step_transitions,
            log_entries: summary.log_entries,
            dropped_events,
        }))
    }
}
