/// All errors that can be returned by a SyncStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No run with the given local id.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: i64 },

    /// A run with this external id is already recorded.
    #[error("run already recorded for external id {external_run_id}")]
    DuplicateRun { external_run_id: String },

    /// A stored value could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// A backend-specific storage error (DB connection, constraint, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
