/// HTTP status codes that are retried with backoff before a query is
/// treated as failed.
pub const RETRIABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// All errors that can be returned by an [`ExecutionEngine`](crate::ExecutionEngine).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine has no record of the run.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Network-level failure (connect, DNS, timeout, reset).
    #[error("engine transport error: {0}")]
    Transport(String),

    /// The engine answered with a non-success HTTP status.
    #[error("engine returned HTTP {status}")]
    Http { status: u16 },

    /// The response body did not have the expected shape.
    #[error("failed to decode engine response: {0}")]
    Decode(String),

    /// The engine reported an error of its own (GraphQL errors, PythonError).
    #[error("engine error: {0}")]
    Engine(String),

    /// The blocking request task panicked or was cancelled.
    #[error("engine request task failed: {0}")]
    Join(String),
}

impl EngineError {
    /// Whether the request that produced this error may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Http { status } => RETRIABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }
}

impl From<ureq::Error> for EngineError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::StatusCode(status) => EngineError::Http { status },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(EngineError::Transport("reset".into()).is_retriable());
        assert!(EngineError::Http { status: 503 }.is_retriable());
        assert!(EngineError::Http { status: 429 }.is_retriable());
        assert!(!EngineError::Http { status: 400 }.is_retriable());
        assert!(!EngineError::Http { status: 404 }.is_retriable());
        assert!(!EngineError::RunNotFound {
            run_id: "abc".into()
        }
        .is_retriable());
        assert!(!EngineError::Decode("bad".into()).is_retriable());
    }

    #[test]
    fn status_code_error_maps_to_http() {
        let err: EngineError = ureq::Error::StatusCode(502).into();
        assert!(matches!(err, EngineError::Http { status: 502 }));
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            EngineError::RunNotFound {
                run_id: "abc".into()
            }
            .to_string(),
            "run not found: abc"
        );
        assert_eq!(
            EngineError::Http { status: 500 }.to_string(),
            "engine returned HTTP 500"
        );
    }
}
