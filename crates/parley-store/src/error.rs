use thiserror::Error;

/// Errors surfaced by the message store. Validation failures are reported
/// to the offending caller only; everything else is a fatal store
/// condition the caller decides how to survive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,
}
