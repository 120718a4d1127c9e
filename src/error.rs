use thiserror::Error;

/// Status taxonomy exposed at the database boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    SystemError,
    LogicError,
    Corruption,
    Busy,
    NotSupported,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::System(_) => ErrorKind::SystemError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Logic(_) => ErrorKind::LogicError,
            Error::Busy(_) => ErrorKind::Busy,
            Error::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    /// Errors that poison the handle: all later mutating calls fail until reopen.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
