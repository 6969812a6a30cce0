use std::future::Future;

use super::{commit_step, seed_run, step_finished, step_started, ts, TestResult};
use crate::record::{StepState, StepStatusRecord};
use crate::SyncStorage;

pub(super) async fn run_step_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "step",
            "start_then_success_records_duration",
            start_then_success_records_duration(factory).await,
        ),
        TestResult::from_result(
            "step",
            "started_does_not_regress_terminal",
            started_does_not_regress_terminal(factory).await,
        ),
        TestResult::from_result(
            "step",
            "success_does_not_override_failure",
            success_does_not_override_failure(factory).await,
        ),
        TestResult::from_result(
            "step",
            "failure_overrides_success",
            failure_overrides_success(factory).await,
        ),
        TestResult::from_result(
            "step",
            "late_start_fills_started_at",
            late_start_fills_started_at(factory).await,
        ),
        TestResult::from_result(
            "step",
            "steps_listed_by_step_code",
            steps_listed_by_step_code(factory).await,
        ),
    ]
}

async fn only_step<S: SyncStorage>(
    s: &S,
    external_run_id: &str,
) -> Result<StepStatusRecord, String> {
    let mut steps = s
        .list_step_statuses(external_run_id)
        .await
        .map_err(|e| e.to_string())?;
    if steps.len() != 1 {
        return Err(format!("expected exactly one step row, got {}", steps.len()));
    }
    steps.pop().ok_or_else(|| "no step row".to_string())
}

async fn start_then_success_records_duration<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    commit_step(&s, &run, &step_started("load", 10)).await?;
    commit_step(&s, &run, &step_finished("load", StepState::Success, 15, None)).await?;

    let step = only_step(&s, "run-a").await?;
    if step.status != StepState::Success
        || step.started_at != Some(ts(10))
        || step.finished_at != Some(ts(15))
        || step.duration_seconds != Some(5.0)
    {
        return Err(format!("unexpected step row: {step:?}"));
    }
    if step.run_id != run.id {
        return Err(format!("run id {} != {}", step.run_id, run.id));
    }
    Ok(())
}

async fn started_does_not_regress_terminal<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    commit_step(&s, &run, &step_started("x", 10)).await?;
    commit_step(&s, &run, &step_finished("x", StepState::Failure, 20, Some("boom"))).await?;
    let before = only_step(&s, "run-a").await?;

    commit_step(&s, &run, &step_started("x", 30)).await?;
    let after = only_step(&s, "run-a").await?;

    if before != after {
        return Err(format!("terminal step changed: {before:?} -> {after:?}"));
    }
    Ok(())
}

async fn success_does_not_override_failure<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    commit_step(&s, &run, &step_finished("x", StepState::Failure, 20, Some("boom"))).await?;
    commit_step(&s, &run, &step_finished("x", StepState::Success, 25, None)).await?;

    let step = only_step(&s, "run-a").await?;
    if step.status != StepState::Failure
        || step.finished_at != Some(ts(20))
        || step.error_message.as_deref() != Some("boom")
    {
        return Err(format!("failure was overridden: {step:?}"));
    }
    Ok(())
}

async fn failure_overrides_success<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    commit_step(&s, &run, &step_finished("x", StepState::Success, 20, None)).await?;
    commit_step(&s, &run, &step_finished("x", StepState::Failure, 21, Some("late"))).await?;

    let step = only_step(&s, "run-a").await?;
    if step.status != StepState::Failure || step.error_message.as_deref() != Some("late") {
        return Err(format!("expected failure to win, got {step:?}"));
    }
    Ok(())
}

async fn late_start_fills_started_at<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    commit_step(&s, &run, &step_finished("x", StepState::Success, 20, None)).await?;
    commit_step(&s, &run, &step_started("x", 12)).await?;

    let step = only_step(&s, "run-a").await?;
    if step.status != StepState::Success
        || step.started_at != Some(ts(12))
        || step.duration_seconds != Some(8.0)
    {
        return Err(format!("unexpected step row: {step:?}"));
    }
    Ok(())
}

async fn steps_listed_by_step_code<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    for code in ["transform", "extract", "load"] {
        commit_step(&s, &run, &step_started(code, 1)).await?;
    }
    let codes: Vec<String> = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|st| st.step_code)
        .collect();
    if codes != ["extract", "load", "transform"] {
        return Err(format!("unexpected order: {codes:?}"));
    }
    Ok(())
}
