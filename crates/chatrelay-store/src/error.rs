/// Errors surfaced by the persistence layer.
///
/// The `Display` text is what a client sees in an error response, so keep it
/// free of SQL and internal detail where a caller can trigger it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
