use thiserror::Error;

pub type TdsResult<T> = Result<T, TdsError>;

#[derive(Debug, Error)]
pub enum TdsError {
    /// Secure channel send/recv failure or an unexpectedly closed session
    #[error("channel error: {0}")]
    Channel(String),

    /// Malformed key batch or a request/response count mismatch
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Container, recipe, or index backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Index, container, and recipe disagree with each other
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TdsError {
    /// True for errors that indicate on-disk state no longer agrees with the indexes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TdsError::Corrupt(_))
    }
}
