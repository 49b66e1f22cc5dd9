use std::{fmt, io};

/// Errors returned by checked entry points.
///
/// Hot-path kernels that take well-typed inputs assert their shape instead; this type is used
/// wherever a caller can describe an inconsistent layout with offsets, lengths or counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Offsets, lengths or layout parameters do not describe a valid call.
    InvalidArgument(String),
    /// Quantization was requested before every codebook row of a partial sums table was computed.
    IncompleteTable { codebook: usize },
    /// The operation is not available for this similarity or table layout.
    Unsupported(&'static str),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Return [`Error::InvalidArgument`] with a lazily formatted message if `cond` does not hold.
pub(crate) fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InvalidArgument(msg()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::IncompleteTable { codebook } => {
                write!(f, "partial sums for codebook {codebook} were never computed")
            }
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<&Error> for io::ErrorKind {
    fn from(value: &Error) -> Self {
        match value {
            Error::InvalidArgument(_) | Error::IncompleteTable { .. } => io::ErrorKind::InvalidInput,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::new(io::ErrorKind::from(&value), value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
