use std::future::Future;

use super::{make_log, seed_run, step_finished, step_started, ts, TestResult};
use crate::record::{DomainStatus, EventKind, RunRecord, RunUpdate, StepState};
use crate::SyncStorage;

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "run_steps_and_logs_visible_after_commit",
            run_steps_and_logs_visible_after_commit(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "reapplying_same_writes_is_idempotent",
            reapplying_same_writes_is_idempotent(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "commits_of_different_runs_are_independent",
            commits_of_different_runs_are_independent(factory).await,
        ),
    ]
}

/// Stage a small complete run (two steps, three logs, final status) and commit.
async fn persist_complete_run<S: SyncStorage>(s: &S, run: &RunRecord) -> Result<(), String> {
    let ext = run.external_run_id.as_str();
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    for transition in [
        step_started("load", 0),
        step_finished("load", StepState::Success, 4, None),
        step_started("save", 5),
        step_finished("save", StepState::Success, 9, None),
    ] {
        s.upsert_step(&mut snap, run.id, ext, &transition)
            .await
            .map_err(|e| e.to_string())?;
    }
    for (kind, at, msg) in [
        (EventKind::StepStart, 0, "load started"),
        (EventKind::Message, 2, "loading rows"),
        (EventKind::StepSuccess, 9, "save done"),
    ] {
        s.append_log(&mut snap, make_log(run, kind, at, msg))
            .await
            .map_err(|e| e.to_string())?;
    }
    s.update_run(
        &mut snap,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Completed),
            started_at: Some(ts(0)),
            finished_at: Some(ts(10)),
            ..RunUpdate::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn run_steps_and_logs_visible_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    persist_complete_run(&s, &run).await?;

    let steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    if steps.len() != 2 || steps.iter().any(|st| st.status != StepState::Success) {
        return Err(format!("unexpected steps: {steps:?}"));
    }
    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    if logs.len() != 3 {
        return Err(format!("expected 3 logs, got {}", logs.len()));
    }
    let stored = s
        .find_run("run-a")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("run missing")?;
    if stored.status != DomainStatus::Completed || stored.duration_seconds != Some(10.0) {
        return Err(format!("unexpected run: {stored:?}"));
    }
    Ok(())
}

async fn reapplying_same_writes_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    persist_complete_run(&s, &run).await?;

    let steps_once = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    let logs_once = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    let run_once = s.find_run("run-a").await.map_err(|e| e.to_string())?;

    persist_complete_run(&s, &run).await?;

    let steps_twice = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    let logs_twice = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    let run_twice = s.find_run("run-a").await.map_err(|e| e.to_string())?;

    if steps_once != steps_twice {
        return Err(format!("steps changed: {steps_once:?} -> {steps_twice:?}"));
    }
    if logs_once != logs_twice {
        return Err(format!(
            "logs changed: {} -> {}",
            logs_once.len(),
            logs_twice.len()
        ));
    }
    if run_once != run_twice {
        return Err(format!("run changed: {run_once:?} -> {run_twice:?}"));
    }
    Ok(())
}

async fn commits_of_different_runs_are_independent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_run(&s, "run-a").await?;
    let b = seed_run(&s, "run-b").await?;
    persist_complete_run(&s, &a).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_step(&mut snap, b.id, "run-b", &step_started("load", 0))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let a_steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    let b_steps = s
        .list_step_statuses("run-b")
        .await
        .map_err(|e| e.to_string())?;
    if a_steps.len() != 2 || !b_steps.is_empty() {
        return Err(format!(
            "expected 2 steps for run-a and none for run-b, got {} and {}",
            a_steps.len(),
            b_steps.len()
        ));
    }
    Ok(())
}
