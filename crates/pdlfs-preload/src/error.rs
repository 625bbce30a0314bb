//! Preload error types.
//!
//! Every error carries an errno so the conventional "sentinel return plus
//! out-of-band error code" pair can always be reconstructed.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

use crate::types::StreamHandle;

/// Preload error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreloadError {
    /// Null/empty path, malformed mode string, negative seek target.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Descriptor not present in the virtualization table.
    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(i32),

    /// Stream handle not present in the virtualization table.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamHandle),

    /// A backend primitive failed; the errno is the backend's own.
    #[error("{op} failed: {errno}")]
    Backend {
        /// Name of the failing primitive.
        op: &'static str,
        /// Error code reported by the backend.
        errno: Errno,
    },

    /// A positioned write transferred fewer bytes than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes handed to the backend.
        expected: usize,
        /// Bytes the backend reported as written.
        written: usize,
    },

    /// Configuration is unusable (malformed root, unresolvable backend).
    #[error("configuration error: {0}")]
    Config(String),

    /// The stream was already closed.
    #[error("stream is closed")]
    Closed,

    /// The backend does not offer this primitive.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl PreloadError {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a Backend error for the named primitive.
    pub fn backend(op: &'static str, errno: Errno) -> Self {
        Self::Backend { op, errno }
    }

    /// The out-of-band error code for this error.
    pub fn errno(&self) -> Errno {
        match self {
            PreloadError::InvalidArgument(_)
            | PreloadError::UnknownDescriptor(_)
            | PreloadError::UnknownStream(_)
            | PreloadError::Config(_) => Errno::INVAL,
            PreloadError::Backend { errno, .. } => *errno,
            PreloadError::ShortWrite { .. } => Errno::IO,
            PreloadError::Closed => Errno::BADF,
            PreloadError::Unsupported(_) => Errno::NOSYS,
        }
    }
}

/// Convert PreloadError to std::io::Error, keeping the errno.
impl From<PreloadError> for io::Error {
    fn from(e: PreloadError) -> Self {
        io::Error::from_raw_os_error(e.errno().raw_os_error())
    }
}

/// Preload result type.
pub type PreloadResult<T> = Result<T, PreloadError>;

/// Adapter for rustix results: tags the errno with the primitive name.
pub(crate) trait BackendResultExt<T> {
    fn op(self, op: &'static str) -> PreloadResult<T>;
}

impl<T> BackendResultExt<T> for rustix::io::Result<T> {
    fn op(self, op: &'static str) -> PreloadResult<T> {
        self.map_err(|errno| PreloadError::backend(op, errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PreloadError::invalid_argument("x").errno(), Errno::INVAL);
        assert_eq!(PreloadError::UnknownDescriptor(7).errno(), Errno::INVAL);
        assert_eq!(
            PreloadError::backend("pread", Errno::NOSPC).errno(),
            Errno::NOSPC
        );
        assert_eq!(
            PreloadError::ShortWrite { expected: 4, written: 1 }.errno(),
            Errno::IO
        );
        assert_eq!(PreloadError::Closed.errno(), Errno::BADF);
    }

    #[test]
    fn test_io_error_keeps_errno() {
        let err: io::Error = PreloadError::backend("open", Errno::NOENT).into();
        assert_eq!(err.raw_os_error(), Some(Errno::NOENT.raw_os_error()));
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_rustix_adapter() {
        let r: rustix::io::Result<()> = Err(Errno::ACCESS);
        let err = r.op("mkdir").unwrap_err();
        assert_eq!(err, PreloadError::backend("mkdir", Errno::ACCESS));
        assert_eq!(err.to_string(), format!("mkdir failed: {}", Errno::ACCESS));
    }
}
