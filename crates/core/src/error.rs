use runsync_engine::EngineError;
use runsync_storage::StorageError;

/// Failure to sync one run. Caught per run; never stops a tick.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
