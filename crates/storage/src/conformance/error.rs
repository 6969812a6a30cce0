use std::future::Future;

use super::{make_new_run, seed_run, step_started, TestResult};
use crate::record::{OutputPathSpec, RunUpdate};
use crate::{StorageError, SyncStorage};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "error",
            "find_run_unknown_is_none",
            find_run_unknown_is_none(factory).await,
        ),
        TestResult::from_result(
            "error",
            "insert_run_duplicate_rejected",
            insert_run_duplicate_rejected(factory).await,
        ),
        TestResult::from_result(
            "error",
            "update_run_unknown_id_fails",
            update_run_unknown_id_fails(factory).await,
        ),
        TestResult::from_result(
            "error",
            "upsert_step_unknown_run_fails",
            upsert_step_unknown_run_fails(factory).await,
        ),
        TestResult::from_result(
            "error",
            "lists_empty_for_unknown_run",
            lists_empty_for_unknown_run(factory).await,
        ),
        TestResult::from_result(
            "error",
            "workflow_output_spec_unknown_is_absent",
            workflow_output_spec_unknown_is_absent(factory).await,
        ),
    ]
}

/// The error may surface when the write is staged or when it is committed;
/// either is acceptable, but it must be `RunNotFound` for the given id.
fn expect_run_not_found(
    staged: Result<(), StorageError>,
    committed: Option<Result<(), StorageError>>,
    run_id: i64,
) -> Result<(), String> {
    match (staged, committed) {
        (Err(StorageError::RunNotFound { run_id: got }), _) if got == run_id => Ok(()),
        (Ok(()), Some(Err(StorageError::RunNotFound { run_id: got }))) if got == run_id => Ok(()),
        (staged, committed) => Err(format!(
            "expected RunNotFound({run_id}), got staged={staged:?} committed={committed:?}"
        )),
    }
}

async fn find_run_unknown_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let found = s.find_run("missing").await.map_err(|e| e.to_string())?;
    if found.is_some() {
        return Err(format!("expected None, got {found:?}"));
    }
    Ok(())
}

async fn insert_run_duplicate_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_run(&s, "run-a").await?;
    match s.insert_run(make_new_run("run-a")).await {
        Err(StorageError::DuplicateRun { external_run_id }) if external_run_id == "run-a" => Ok(()),
        other => Err(format!("expected DuplicateRun, got {other:?}")),
    }
}

async fn update_run_unknown_id_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let staged = s
        .update_run(&mut snap, 424_242, RunUpdate::default())
        .await;
    let committed = if staged.is_ok() {
        Some(s.commit_snapshot(snap).await)
    } else {
        let _ = s.abort_snapshot(snap).await;
        None
    };
    expect_run_not_found(staged, committed, 424_242)
}

async fn upsert_step_unknown_run_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let staged = s
        .upsert_step(&mut snap, 424_242, "ghost", &step_started("load", 0))
        .await;
    let committed = if staged.is_ok() {
        Some(s.commit_snapshot(snap).await)
    } else {
        let _ = s.abort_snapshot(snap).await;
        None
    };
    expect_run_not_found(staged, committed, 424_242)?;

    let steps = s
        .list_step_statuses("ghost")
        .await
        .map_err(|e| e.to_string())?;
    if !steps.is_empty() {
        return Err(format!("orphan step rows stored: {steps:?}"));
    }
    Ok(())
}

async fn lists_empty_for_unknown_run<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let steps = s
        .list_step_statuses("missing")
        .await
        .map_err(|e| e.to_string())?;
    let logs = s.list_logs("missing").await.map_err(|e| e.to_string())?;
    if !steps.is_empty() || !logs.is_empty() {
        return Err(format!(
            "expected no rows, got {} steps and {} logs",
            steps.len(),
            logs.len()
        ));
    }
    Ok(())
}

async fn workflow_output_spec_unknown_is_absent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let spec = s
        .workflow_output_spec(99_999)
        .await
        .map_err(|e| e.to_string())?;
    if spec != OutputPathSpec::Absent {
        return Err(format!("expected Absent, got {spec:?}"));
    }
    Ok(())
}
