//! Error types.

/// Why a submitted task did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The worker's stdin rejected the request line.
    #[error("failed to write request to worker: {0}")]
    WriteFailure(String),
    /// The worker exited abnormally while the request was in flight.
    #[error("worker crashed while the task was in flight")]
    WorkerCrashed,
    /// The worker shut down deliberately, or the dispatcher was shut down.
    #[error("dispatcher terminated")]
    Terminated,
    #[error("task timed out")]
    Timeout,
    /// The pending entry was dropped without an answer.
    #[error("task abandoned without a result")]
    Abandoned,
    #[error("failed to encode task payload: {0}")]
    Encode(String),
    /// The worker answered with a payload that does not decode as the
    /// expected result type.
    #[error("malformed result payload: {0}")]
    MalformedResult(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<SpawnError> for DispatchError {
    fn from(e: SpawnError) -> Self {
        Self::Spawn(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}
