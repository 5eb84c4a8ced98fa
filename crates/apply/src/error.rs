use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Rejected before the run started.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Aborts the run; reported as the single Error event.
    #[error("{0}")]
    Fatal(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl ApplyError {
    pub fn fatal(context: &str, err: anyhow::Error) -> Self { ApplyError::Fatal(format!("{context}: {err:#}")) }
}

pub type ApplyResult<T> = Result<T, ApplyError>;
