use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FieldreqError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Conflict: {0}")]
    ConflictError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// True when the underlying SQLite error is a UNIQUE constraint violation.
/// Version races and duplicate endpoint registrations surface this way and
/// are mapped to `ConflictError` at the store boundary.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
