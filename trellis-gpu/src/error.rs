use std::fmt;

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Device-level failure.
///
/// Only failures of the device itself live here; malformed source
/// geometry is recovered where it is found and ordering-contract
/// violations panic instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The device could not allocate a buffer of the requested size.
    AllocationFailed { size: u64, label: String },

    /// Compacted-size query results were read before the submission that
    /// wrote them completed.
    QueryUnavailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailed { size, label } => {
                write!(f, "couldn't allocate {} bytes for `{}`", size, label)
            }
            Error::QueryUnavailable => {
                write!(f, "compacted-size query results are not available yet")
            }
        }
    }
}

impl std::error::Error for Error {}
