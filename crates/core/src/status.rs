//! Engine status to local status mapping.

use runsync_storage::DomainStatus;

/// Map an engine run status onto the local status vocabulary.
///
/// Total and pure. Statuses this mapper does not know are carried through
/// unchanged as [`DomainStatus::Other`].
pub fn map_status(engine_status: &str) -> DomainStatus {
    match engine_status {
        "SUCCESS" => DomainStatus::Completed,
        "FAILURE" => DomainStatus::Failed,
        "CANCELED" => DomainStatus::Cancelled,
        "QUEUED" | "NOT_STARTED" => DomainStatus::Queued,
        "STARTED" | "STARTING" | "RUNNING" => DomainStatus::Running,
        "CANCELING" => DomainStatus::Cancelling,
        other => DomainStatus::Other(other.to_string()),
    }
}

/// True only for a run the engine reports as finished successfully.
pub fn is_success_terminal(engine_status: &str) -> bool {
    engine_status == "SUCCESS"
}
