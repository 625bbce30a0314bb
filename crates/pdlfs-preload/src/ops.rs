//! Backend operations trait.
//!
//! This is the contract the preload core consumes from each storage system:
//! descriptor-based, POSIX-like, blocking. Paths handed to a backend are
//! already backend-relative; the router does the translation.

use std::os::fd::RawFd;

use crate::error::{PreloadError, PreloadResult};
use crate::types::{FileStat, OpenFlags};

/// Core backend operations trait.
///
/// Descriptors returned by [`FileOps::open`] live in the backend's own
/// namespace. The descriptor table decides what the application sees.
pub trait FileOps: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Create a directory.
    fn mkdir(&self, path: &str, mode: u32) -> PreloadResult<()>;

    /// Open a file, returning a backend descriptor.
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> PreloadResult<RawFd>;

    // ========================================================================
    // Descriptor I/O
    // ========================================================================

    /// Get descriptor metadata.
    fn fstat(&self, fd: RawFd) -> PreloadResult<FileStat>;

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// A short count signals end-of-data, not an error.
    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> PreloadResult<usize>;

    /// Write `buf` at `offset`, returning the number of bytes written.
    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> PreloadResult<usize>;

    /// Read at the descriptor's own file position.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> PreloadResult<usize>;

    /// Write at the descriptor's own file position.
    fn write(&self, fd: RawFd, buf: &[u8]) -> PreloadResult<usize>;

    /// Release the descriptor.
    fn close(&self, fd: RawFd) -> PreloadResult<()>;

    /// Duplicate `fd` onto the lowest free number `>= min`.
    ///
    /// Only the native backend can renumber descriptors.
    fn duplicate(&self, fd: RawFd, min: RawFd) -> PreloadResult<RawFd> {
        let _ = (fd, min);
        Err(PreloadError::Unsupported("duplicate"))
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Open and stat in one step.
    ///
    /// If the stat fails the descriptor is closed again and the stat error
    /// is returned.
    fn open_with_stat(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> PreloadResult<(RawFd, FileStat)> {
        let fd = self.open(path, flags, mode)?;
        match self.fstat(fd) {
            Ok(stat) => Ok((fd, stat)),
            Err(e) => {
                if let Err(close_err) = self.close(fd) {
                    tracing::warn!(fd, "failed to close after fstat error: {close_err}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rustix::io::Errno;

    /// Opens succeed, everything else fails.
    #[derive(Default)]
    struct StatFails {
        closed: Mutex<Vec<RawFd>>,
    }

    impl FileOps for StatFails {
        fn name(&self) -> &'static str {
            "stat-fails"
        }
        fn mkdir(&self, _: &str, _: u32) -> PreloadResult<()> {
            Err(PreloadError::Unsupported("mkdir"))
        }
        fn open(&self, _: &str, _: OpenFlags, _: u32) -> PreloadResult<RawFd> {
            Ok(7)
        }
        fn fstat(&self, _: RawFd) -> PreloadResult<FileStat> {
            Err(PreloadError::backend("fstat", Errno::IO))
        }
        fn pread(&self, _: RawFd, _: &mut [u8], _: u64) -> PreloadResult<usize> {
            Err(PreloadError::Unsupported("pread"))
        }
        fn pwrite(&self, _: RawFd, _: &[u8], _: u64) -> PreloadResult<usize> {
            Err(PreloadError::Unsupported("pwrite"))
        }
        fn read(&self, _: RawFd, _: &mut [u8]) -> PreloadResult<usize> {
            Err(PreloadError::Unsupported("read"))
        }
        fn write(&self, _: RawFd, _: &[u8]) -> PreloadResult<usize> {
            Err(PreloadError::Unsupported("write"))
        }
        fn close(&self, fd: RawFd) -> PreloadResult<()> {
            self.closed.lock().push(fd);
            Err(PreloadError::backend("close", Errno::BADF))
        }
    }

    #[test]
    fn test_open_with_stat_closes_on_stat_error() {
        let ops = StatFails::default();
        let err = ops.open_with_stat("/f", OpenFlags::read(), 0).unwrap_err();

        // The stat error wins over the failed close.
        assert_eq!(err.errno(), Errno::IO);
        assert_eq!(*ops.closed.lock(), vec![7]);
    }
}
