use thiserror::Error;

/// Errors reported by shardmap builders and readers.
///
/// A missing key is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Offset bookkeeping during finalize disagrees with the stream position.
    #[error("inconsistent stream offset (expected {expected}, got {actual})")]
    InconsistentOffset { expected: u64, actual: u64 },
}

impl Error {
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }

    /// Returns `true` for [`Error::Corruption`].
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Returns `true` for [`Error::Io`].
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
