use std::fmt::Display;

/// A specialized error type for log store operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A caller-supplied argument was rejected at the boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The target is busy (e.g. a range is already being recovered); the
    /// caller may retry.
    #[error("busy: {0}")]
    Busy(String),
    /// An I/O error occurred. Not recoverable at this level.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected (bad checksum, impossible length,
    /// truncated header).
    #[error("data corruption: {0}")]
    Corruption(String),
    /// The store has been closed; the operation was not performed.
    #[error("log store is shut down")]
    Shutdown,
}

impl LogError {
    /// Create an invalid-argument error from a displayable value.
    pub fn invalid_argument<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidArgument(msg.to_string())
    }

    /// Create a busy error from a displayable value.
    pub fn busy<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Busy(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }
}

/// A Result type alias for log store operations.
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_helper() {
        let err = LogError::invalid_argument("no payload");
        assert!(matches!(err, LogError::InvalidArgument(msg) if msg == "no payload"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = LogError::from(io);
        assert!(matches!(err, LogError::Io(_)));
    }
}
