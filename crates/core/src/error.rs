use thiserror::Error;

/// Errors raised while interpreting documents and identifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("document is not an object")]
    NotAnObject,
    #[error("document missing {0}")]
    MissingField(&'static str),
    #[error("invalid identifier {0:?} (expect namespace_name_group_kind)")]
    InvalidIdentifier(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
