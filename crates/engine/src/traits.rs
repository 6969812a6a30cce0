use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::types::{RunDetail, RunSummary};

/// Read-only query contract against the execution engine.
///
/// Implementations must be `Send + Sync + 'static` so a single handle can be
/// shared between the periodic driver and on-demand HTTP handlers.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Fetch status, timing, config and the complete ordered event list for
    /// one run.
    ///
    /// Returns `Err(EngineError::RunNotFound)` if the engine has no such run.
    async fn get_run_detail(&self, external_run_id: &str) -> Result<RunDetail, EngineError>;

    /// List runs updated strictly after `updated_after` and at or before
    /// `updated_before`, newest first, at most `limit` entries. A `None`
    /// bound is open.
    async fn list_recently_updated_runs(
        &self,
        limit: usize,
        updated_after: Option<OffsetDateTime>,
        updated_before: Option<OffsetDateTime>,
    ) -> Result<Vec<RunSummary>, EngineError>;
}
