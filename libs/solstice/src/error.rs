#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid input")]
    InvalidInput,
    #[error("out of resources")]
    NoResources,
    #[error("no space left in queue")]
    NoSpace,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("unsupported on this platform")]
    Unsupported,
    #[error("integer overflow")]
    Overflow,
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(err.raw_os_error()))
    }
}

impl Error {
    /// Whether a syscall error is transient and the operation should simply
    /// be retried on the next readiness notification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
