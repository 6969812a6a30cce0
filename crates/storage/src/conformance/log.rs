use std::future::Future;

use super::{make_log, seed_run, TestResult};
use crate::record::{EventKind, LogEntryRecord, LogLevel};
use crate::SyncStorage;

pub(super) async fn run_log_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "log",
            "log_fields_preserved",
            log_fields_preserved(factory).await,
        ),
        TestResult::from_result(
            "log",
            "same_key_replaces_entry",
            same_key_replaces_entry(factory).await,
        ),
        TestResult::from_result(
            "log",
            "distinct_kinds_at_same_time_both_kept",
            distinct_kinds_at_same_time_both_kept(factory).await,
        ),
        TestResult::from_result(
            "log",
            "logs_ordered_by_timestamp",
            logs_ordered_by_timestamp(factory).await,
        ),
    ]
}

async fn append_all<S: SyncStorage>(s: &S, entries: Vec<LogEntryRecord>) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    for entry in entries {
        s.append_log(&mut snap, entry)
            .await
            .map_err(|e| e.to_string())?;
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn log_fields_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    let entry = LogEntryRecord {
        step_code: Some("load".into()),
        level: LogLevel::Error,
        payload: serde_json::json!({
            "__typename": "ExecutionStepFailureEvent",
            "stepKey": "load",
            "error": {"message": "boom"},
        }),
        ..make_log(&run, EventKind::StepFailure, 3, "boom")
    };
    append_all(&s, vec![entry.clone()]).await?;

    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    if logs != vec![entry] {
        return Err(format!("stored log differs: {logs:?}"));
    }
    Ok(())
}

async fn same_key_replaces_entry<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    append_all(&s, vec![make_log(&run, EventKind::Message, 3, "first")]).await?;
    append_all(&s, vec![make_log(&run, EventKind::Message, 3, "second")]).await?;

    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    match logs.as_slice() {
        [only] if only.message == "second" => Ok(()),
        other => Err(format!("expected one replaced entry, got {other:?}")),
    }
}

async fn distinct_kinds_at_same_time_both_kept<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    append_all(
        &s,
        vec![
            make_log(&run, EventKind::StepStart, 3, "start"),
            make_log(&run, EventKind::Message, 3, "message"),
        ],
    )
    .await?;

    let logs = s.list_logs("run-a").await.map_err(|e| e.to_string())?;
    if logs.len() != 2 {
        return Err(format!("expected 2 entries, got {}", logs.len()));
    }
    Ok(())
}

async fn logs_ordered_by_timestamp<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = seed_run(&s, "run-a").await?;
    append_all(
        &s,
        vec![
            make_log(&run, EventKind::Message, 9, "third"),
            make_log(&run, EventKind::Message, 1, "first"),
            make_log(&run, EventKind::Message, 5, "second"),
        ],
    )
    .await?;

    let messages: Vec<String> = s
        .list_logs("run-a")
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|l| l.message)
        .collect();
    if messages != ["first", "second", "third"] {
        return Err(format!("unexpected order: {messages:?}"));
    }
    Ok(())
}
