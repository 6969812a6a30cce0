//! Query contract for the external execution engine.
//!
//! The sync engine never schedules or executes steps. It only reads run
//! metadata and event history through [`ExecutionEngine`]. [`GraphqlEngine`]
//! implements the contract against a Dagster-compatible GraphQL endpoint.

mod error;
mod graphql;
mod retry;
mod traits;
mod types;

pub use error::{EngineError, RETRIABLE_STATUS_CODES};
pub use graphql::{GraphqlEngine, GraphqlEngineConfig};
pub use retry::BackoffPolicy;
pub use traits::ExecutionEngine;
pub use types::{epoch_seconds, RunDetail, RunSummary};
