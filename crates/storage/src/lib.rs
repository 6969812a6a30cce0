pub mod conformance;
mod error;
pub mod memory;
pub mod merge;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{
    DomainStatus, EventKind, LogEntryRecord, LogLevel, NewRun, OutputLocation, OutputPathSpec,
    OutputTemplate, RunRecord, RunUpdate, StepState, StepStatusRecord, StepTransition,
};
pub use traits::SyncStorage;
