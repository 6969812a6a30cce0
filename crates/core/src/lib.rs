//! Run status synchronization.
//!
//! Reconciles the append-only event history of an external execution engine
//! with the local snapshot of run, step and log state. Writes are idempotent
//! and isolated per run; a cursor over run update times keeps periodic
//! passes from rescanning history.

pub mod driver;
mod error;
pub mod gateway;
pub mod orchestrator;
pub mod output_paths;
pub mod reducer;
pub mod status;
pub mod template;

pub use driver::{spawn_sync_driver, SyncDriver};
pub use error::SyncError;
pub use gateway::{persist_run, PersistSummary, RunPersistPlan};
pub use orchestrator::{
    next_cursor, Clock, RunOutcome, RunSyncSummary, SyncOrchestrator, SyncSettings, TickReport,
    TriggerResponse,
};
pub use output_paths::{resolve, resolve_at, try_resolve_at, ResolveError};
pub use reducer::{reduce, EngineEvent, EngineEventKind, LogDraft, MalformedEvent, ReducedEffect};
pub use status::{is_success_terminal, map_status};
