use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error. `Wait` is not a failure, it signals that an operation could not make
/// progress without blocking and should be retried once more data or capacity is available.
#[derive(Debug)]
pub enum Error {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("malformed request: {0}")]
    Parameter(&'static str),
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
    #[error("frame below minimum header size")]
    FrameTooSmall,
    #[error("unsupported protocol version")]
    ProtocolVersion,
    #[error("unknown frame type")]
    FrameType,
    #[error("field extends past end of message")]
    FieldOverrun,
    #[error("batch disabled")]
    BatchDisabled,
    #[error("batch request count exceeds configured maximum")]
    BatchMaxRequests,
    #[error("no batch response queue accepted the request")]
    BatchQueuesFull,
    #[error("single batch result exceeds per-row cap")]
    RecordTooBig,
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::Wait,
            kind => Error::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Error::Fatal(kind)
    }
}

pub trait ErrorUtils {
    /// True for any outcome other than success or a would-block wait.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for Result<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(Error::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_demotes_to_wait() {
        let io_err: io::Error = io::ErrorKind::WouldBlock.into();
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Wait));
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let io_err: io::Error = io::ErrorKind::ConnectionReset.into();
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset))));
    }

    #[test]
    fn has_failed_is_false_for_wait() {
        let result: Result<()> = Err(Error::Wait);
        assert!(!result.has_failed());
    }

    #[test]
    fn has_failed_is_true_for_fatal() {
        let result: Result<()> = Err(Error::Fatal(ErrorKind::FrameTooLarge));
        assert!(result.has_failed());
    }
}
