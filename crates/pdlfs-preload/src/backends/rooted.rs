//! PDLFS hosted on a local directory.
//!
//! Stands in for the distributed filesystem when none is deployed: every
//! backend-relative path is placed under `root` on the native filesystem,
//! and descriptor I/O is delegated to a private [`NativeBackend`].

use std::os::fd::RawFd;

use rustix::io::Errno;

use crate::backends::NativeBackend;
use crate::error::{PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::types::{FileStat, OpenFlags};

/// Permission bits for the root directory.
const ROOT_DIR_MODE: u32 = 0o777;

/// PDLFS backend rooted at a local directory.
///
/// A backend-relative path such as `/a/b` maps to `{root}/a/b`.
#[derive(Debug)]
pub struct RootedBackend {
    root: String,
    native: NativeBackend,
}

impl RootedBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    ///
    /// `root` must be absolute and already normalized (no trailing slash).
    pub fn new(root: impl Into<String>) -> PreloadResult<Self> {
        let root = root.into();
        if !root.starts_with('/') || root.len() < 2 {
            return Err(PreloadError::config(format!(
                "pdlfs root must be an absolute directory: {root:?}"
            )));
        }

        let native = NativeBackend::new();
        match native.mkdir(&root, ROOT_DIR_MODE) {
            Ok(()) => {}
            Err(e) if e.errno() == Errno::EXIST => {}
            Err(e) => {
                return Err(PreloadError::config(format!(
                    "cannot prepare pdlfs root {root}: {e}"
                )));
            }
        }

        Ok(Self { root, native })
    }

    /// Get the root path.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Map a backend-relative path onto the local directory.
    fn host_path(&self, path: &str) -> PreloadResult<String> {
        if !path.starts_with('/') {
            return Err(PreloadError::invalid_argument(format!(
                "pdlfs paths are absolute: {path:?}"
            )));
        }
        if path == "/" {
            return Ok(self.root.clone());
        }
        Ok(format!("{}{}", self.root, path))
    }
}

impl FileOps for RootedBackend {
    fn name(&self) -> &'static str {
        "pdlfs"
    }

    fn mkdir(&self, path: &str, mode: u32) -> PreloadResult<()> {
        self.native.mkdir(&self.host_path(path)?, mode)
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> PreloadResult<RawFd> {
        self.native.open(&self.host_path(path)?, flags, mode)
    }

    fn fstat(&self, fd: RawFd) -> PreloadResult<FileStat> {
        self.native.fstat(fd)
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> PreloadResult<usize> {
        self.native.pread(fd, buf, offset)
    }

    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> PreloadResult<usize> {
        self.native.pwrite(fd, buf, offset)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> PreloadResult<usize> {
        self.native.read(fd, buf)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> PreloadResult<usize> {
        self.native.write(fd, buf)
    }

    fn close(&self, fd: RawFd) -> PreloadResult<()> {
        self.native.close(fd)
    }
}
