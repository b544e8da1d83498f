use thiserror::Error;

/// Failure taxonomy shared by every engine backend and the request
/// pipeline above them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or inconsistent arguments: missing columns, unknown ids,
    /// concurrent use of a single transaction.
    #[error("invalid argument: {0}")]
    ArgsWrong(String),

    /// An arena or backend allocation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A commit found one of its watched keys overwritten by another
    /// committed transaction.
    #[error("conflict: a watched key was overwritten after it was read")]
    ConflictingWrite,

    /// The backend reported an I/O or consistency failure.
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// Failures with no better classification, e.g. session-pool
    /// exhaustion.
    #[error("{0}")]
    Unknown(String),
}

impl EngineError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self::ArgsWrong(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::EngineFailure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
