use thiserror::Error;

/// Error taxonomy for the store façade and everything layered on it.
///
/// The protocol boundary maps each kind to the nearest protocol error:
/// `NotFound` becomes "no such file", `Invalid` an argument failure,
/// `Unsupported` is surfaced textually, and `Backend`/`Io` are logged
/// with context before being surfaced.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("does not exist: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("unsupported command: '{0}'")]
    Unsupported(String),

    #[error("store error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound("query returned no rows".to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
