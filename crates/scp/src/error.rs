use lattice_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScpError {
    /// The session failed to validate its user or project; every later
    /// callback short-circuits with this.
    #[error("scp session cannot proceed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scp protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ScpError>;
