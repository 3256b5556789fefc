use thiserror::Error;

/// Errors raised by the container engine.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or foreign file: bad magic, bad block size, truncated header,
    /// corrupt directory. Raised at open time.
    #[error("invalid container format: {0}")]
    Format(String),

    /// A stream outgrew `max_depth` or the file outgrew the 32-bit block space.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Operation not valid in the current state (e.g. write after close).
    #[error("invalid use: {0}")]
    Usage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("seek out of bounds: {0}")]
    SeekOutOfBounds(String),

    /// A failure from the implicit close of a dropped stream handle,
    /// surfaced on the next writer operation.
    #[error("deferred failure while closing an abandoned stream: {0}")]
    Deferred(Box<MuxError>),
}

pub type Result<T> = std::result::Result<T, MuxError>;

impl From<MuxError> for std::io::Error {
    fn from(e: MuxError) -> Self {
        use std::io::ErrorKind;
        match e {
            MuxError::Io(inner) => inner,
            MuxError::Format(_) => std::io::Error::new(ErrorKind::InvalidData, e),
            MuxError::SeekOutOfBounds(_) | MuxError::InvalidConfig(_) => {
                std::io::Error::new(ErrorKind::InvalidInput, e)
            }
            other => std::io::Error::other(other),
        }
    }
}
