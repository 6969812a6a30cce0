use std::future::Future;

use super::{make_log, seed_run, step_started, TestResult};
use crate::record::{DomainStatus, EventKind, RunUpdate};
use crate::SyncStorage;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "empty_snapshot_commits",
            empty_snapshot_commits(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_writes_invisible",
            uncommitted_writes_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "aborted_writes_discarded",
            aborted_writes_discarded(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "dropped_snapshot_discarded",
            dropped_snapshot_discarded(factory).await,
        ),
    ]
}

async fn empty_snapshot_commits<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn uncommitted_writes_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_step(&mut snap, run.id, "run-a", &step_started("load", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.append_log(&mut snap, make_log(&run, EventKind::Message, 1, "hi"))
        .await
        .map_err(|e| e.to_string())?;
    s.update_run(
        &mut snap,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Running),
            ..RunUpdate::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    // Not committed yet.

    let steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    let stored = s.find_run("run-a").await.map_err(|e| e.to_string())?;

    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if !steps.is_empty() || !logs.is_empty() {
        return Err(format!(
            "uncommitted rows visible: {} steps, {} logs",
            steps.len(),
            logs.len()
        ));
    }
    match stored {
        Some(r) if r.status == DomainStatus::Queued => Ok(()),
        other => Err(format!("uncommitted run update visible: {other:?}")),
    }
}

async fn aborted_writes_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_step(&mut snap, run.id, "run-a", &step_started("load", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.append_log(&mut snap, make_log(&run, EventKind::StepStart, 1, "start"))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    if !steps.is_empty() || !logs.is_empty() {
        return Err("aborted writes were persisted".into());
    }
    Ok(())
}

async fn dropped_snapshot_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;

    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.upsert_step(&mut snap, run.id, "run-a", &step_started("load", 1))
            .await
            .map_err(|e| e.to_string())?;
    }

    let steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    if !steps.is_empty() {
        return Err("dropped snapshot's writes were persisted".into());
    }
    Ok(())
}
