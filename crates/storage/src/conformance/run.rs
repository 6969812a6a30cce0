use std::future::Future;

use super::{seed_run, ts, TestResult};
use crate::record::{DomainStatus, OutputLocation, RunUpdate};
use crate::SyncStorage;

pub(super) async fn run_run_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "run",
            "insert_run_assigns_id_and_is_findable",
            insert_run_assigns_id_and_is_findable(factory).await,
        ),
        TestResult::from_result(
            "run",
            "insert_run_ids_are_distinct",
            insert_run_ids_are_distinct(factory).await,
        ),
        TestResult::from_result(
            "run",
            "update_run_to_terminal_sets_finish_fields",
            update_run_to_terminal_sets_finish_fields(factory).await,
        ),
        TestResult::from_result(
            "run",
            "terminal_run_keeps_status_and_finish_time",
            terminal_run_keeps_status_and_finish_time(factory).await,
        ),
        TestResult::from_result(
            "run",
            "started_at_set_only_once",
            started_at_set_only_once(factory).await,
        ),
        TestResult::from_result(
            "run",
            "output_locations_replaced_and_preserved",
            output_locations_replaced_and_preserved(factory).await,
        ),
        TestResult::from_result(
            "run",
            "terminal_run_output_locations_are_frozen",
            terminal_run_output_locations_are_frozen(factory).await,
        ),
    ]
}

async fn update_in_snapshot<S: SyncStorage>(
    s: &S,
    run_id: i64,
    update: RunUpdate,
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_run(&mut snap, run_id, update)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn find<S: SyncStorage>(s: &S, external_run_id: &str) -> Result<crate::RunRecord, String> {
    s.find_run(external_run_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("run {external_run_id} not found"))
}

async fn insert_run_assigns_id_and_is_findable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let inserted = seed_run(&s, "run-a").await?;
    let found = find(&s, "run-a").await?;

    if found.id != inserted.id {
        return Err(format!("id mismatch: {} vs {}", found.id, inserted.id));
    }
    if found.status != DomainStatus::Queued || found.workflow_id != 7 {
        return Err(format!("unexpected stored run: {found:?}"));
    }
    if found.run_config != inserted.run_config {
        return Err("run_config not preserved".into());
    }
    if !found.output_locations.is_empty() || found.finished_at.is_some() {
        return Err(format!("new run should have no outputs or finish: {found:?}"));
    }
    Ok(())
}

async fn insert_run_ids_are_distinct<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_run(&s, "run-a").await?;
    let b = seed_run(&s, "run-b").await?;
    if a.id == b.id {
        return Err(format!("both runs got id {}", a.id));
    }
    Ok(())
}

async fn update_run_to_terminal_sets_finish_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;

    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Running),
            started_at: Some(ts(0)),
            ..RunUpdate::default()
        },
    )
    .await?;
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Failed),
            finished_at: Some(ts(30)),
            error_message: Some("step x failed".into()),
            ..RunUpdate::default()
        },
    )
    .await?;

    let found = find(&s, "run-a").await?;
    if found.status != DomainStatus::Failed {
        return Err(format!("expected failed, got {}", found.status));
    }
    if found.finished_at != Some(ts(30)) {
        return Err(format!("unexpected finished_at {:?}", found.finished_at));
    }
    if found.duration_seconds != Some(30.0) {
        return Err(format!("unexpected duration {:?}", found.duration_seconds));
    }
    if found.error_message.as_deref() != Some("step x failed") {
        return Err(format!("unexpected error {:?}", found.error_message));
    }
    Ok(())
}

async fn terminal_run_keeps_status_and_finish_time<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    let done = RunUpdate {
        status: Some(DomainStatus::Completed),
        started_at: Some(ts(0)),
        finished_at: Some(ts(10)),
        ..RunUpdate::default()
    };
    update_in_snapshot(&s, run.id, done.clone()).await?;
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Running),
            finished_at: Some(ts(99)),
            ..RunUpdate::default()
        },
    )
    .await?;
    // Re-applying the terminal update is a no-op.
    update_in_snapshot(&s, run.id, done).await?;

    let found = find(&s, "run-a").await?;
    if found.status != DomainStatus::Completed
        || found.finished_at != Some(ts(10))
        || found.duration_seconds != Some(10.0)
    {
        return Err(format!("terminal run changed: {found:?}"));
    }
    Ok(())
}

async fn started_at_set_only_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    for at in [5, 50] {
        update_in_snapshot(
            &s,
            run.id,
            RunUpdate {
                started_at: Some(ts(at)),
                ..RunUpdate::default()
            },
        )
        .await?;
    }
    let found = find(&s, "run-a").await?;
    if found.started_at != Some(ts(5)) {
        return Err(format!("started_at overwritten: {:?}", found.started_at));
    }
    Ok(())
}

async fn output_locations_replaced_and_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    let locations = vec![OutputLocation {
        path: "out/7/b1.json".into(),
        name: Some("Output Path".into()),
        description: Some("Output written by step 'save'".into()),
    }];
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            output_locations: Some(locations.clone()),
            ..RunUpdate::default()
        },
    )
    .await?;
    // An update without locations leaves them alone.
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Running),
            ..RunUpdate::default()
        },
    )
    .await?;

    let found = find(&s, "run-a").await?;
    if found.output_locations != locations {
        return Err(format!(
            "unexpected output locations {:?}",
            found.output_locations
        ));
    }
    Ok(())
}

async fn terminal_run_output_locations_are_frozen<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    let location = |path: &str| OutputLocation {
        path: path.into(),
        name: None,
        description: None,
    };
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Completed),
            finished_at: Some(ts(10)),
            output_locations: Some(vec![location("out/20240305_140709.csv")]),
            ..RunUpdate::default()
        },
    )
    .await?;
    update_in_snapshot(
        &s,
        run.id,
        RunUpdate {
            status: Some(DomainStatus::Completed),
            output_locations: Some(vec![location("out/20240306_090000.csv")]),
            ..RunUpdate::default()
        },
    )
    .await?;

    let found = find(&s, "run-a").await?;
    if found.output_locations != vec![location("out/20240305_140709.csv")] {
        return Err(format!(
            "terminal run output locations changed: {:?}",
            found.output_locations
        ));
    }
    Ok(())
}
