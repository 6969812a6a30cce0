use std::future::Future;
use std::sync::Arc;

use super::{commit_step, seed_run, step_finished, step_started, TestResult};
use crate::record::{RunRecord, StepState};
use crate::SyncStorage;

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "parallel_runs_all_persist",
            parallel_runs_all_persist(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "racing_start_and_success_end_terminal",
            racing_start_and_success_end_terminal(factory).await,
        ),
    ]
}

async fn parallel_runs_all_persist<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = Arc::new(factory().await);
    let mut runs = Vec::with_capacity(N);
    for i in 0..N {
        runs.push(seed_run(s.as_ref(), &format!("run-{i}")).await?);
    }

    let mut handles = Vec::with_capacity(N);
    for run in runs {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move {
            commit_step(s.as_ref(), &run, &step_started("load", 1)).await?;
            commit_step(
                s.as_ref(),
                &run,
                &step_finished("load", StepState::Success, 2, None),
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.map_err(|e| e.to_string())??;
    }

    for i in 0..N {
        let steps = s
            .list_step_statuses(&format!("run-{i}"))
            .await
            .map_err(|e| e.to_string())?;
        if steps.len() != 1 || steps[0].status != StepState::Success {
            return Err(format!("run-{i}: unexpected steps {steps:?}"));
        }
    }
    Ok(())
}

/// Two syncs of the same run racing: one applies STARTED, the other SUCCESS.
/// Whatever the interleaving, the step must end in SUCCESS.
async fn racing_start_and_success_end_terminal<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = Arc::new(factory().await);
    let run: RunRecord = seed_run(s.as_ref(), "run-a").await?;

    let mut handles = Vec::with_capacity(N);
    for i in 0..N {
        let s = Arc::clone(&s);
        let run = run.clone();
        handles.push(tokio::spawn(async move {
            let transition = if i % 2 == 0 {
                step_started("load", 1)
            } else {
                step_finished("load", StepState::Success, 2, None)
            };
            commit_step(s.as_ref(), &run, &transition).await
        }));
    }
    for handle in handles {
        handle.await.map_err(|e| e.to_string())??;
    }

    let steps = s
        .list_step_statuses("run-a")
        .await
        .map_err(|e| e.to_string())?;
    match steps.as_slice() {
        [only] if only.status == StepState::Success => Ok(()),
        other => Err(format!("expected a single SUCCESS row, got {other:?}")),
    }
}
