use std::future::Future;

use super::{ts, TestResult};
use crate::SyncStorage;

pub(super) async fn run_cursor_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "cursor",
            "cursor_initially_absent",
            cursor_initially_absent(factory).await,
        ),
        TestResult::from_result(
            "cursor",
            "stored_cursor_is_loaded",
            stored_cursor_is_loaded(factory).await,
        ),
    ]
}

async fn cursor_initially_absent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.load_cursor().await.map_err(|e| e.to_string())? {
        None => Ok(()),
        Some(c) => Err(format!("expected no cursor, got {c}")),
    }
}

async fn stored_cursor_is_loaded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.store_cursor(ts(100)).await.map_err(|e| e.to_string())?;
    s.store_cursor(ts(200)).await.map_err(|e| e.to_string())?;
    match s.load_cursor().await.map_err(|e| e.to_string())? {
        Some(c) if c == ts(200) => Ok(()),
        other => Err(format!("expected latest cursor, got {other:?}")),
    }
}
