//! Native filesystem backend.
//!
//! Talks to the kernel through rustix, which issues raw system calls on
//! Linux and therefore never re-enters an interposed libc symbol.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::fs::Mode;
use rustix::io::Errno;

use crate::error::{BackendResultExt, PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::types::{FileStat, OpenFlags};

/// Native filesystem backend.
///
/// Owns every descriptor it hands out. The lock only guards the descriptor
/// map; system calls run on a cloned `Arc<OwnedFd>` after it is released.
#[derive(Debug, Default)]
pub struct NativeBackend {
    fds: Mutex<HashMap<RawFd, Arc<OwnedFd>>>,
}

impl NativeBackend {
    /// Create a backend with no open descriptors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors currently held open.
    pub fn open_count(&self) -> usize {
        self.fds.lock().len()
    }

    fn get(&self, fd: RawFd) -> PreloadResult<Arc<OwnedFd>> {
        self.fds
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(PreloadError::backend("lookup", Errno::BADF))
    }

    fn adopt(&self, owned: OwnedFd) -> RawFd {
        let raw = owned.as_raw_fd();
        self.fds.lock().insert(raw, Arc::new(owned));
        raw
    }
}

impl FileOps for NativeBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn mkdir(&self, path: &str, mode: u32) -> PreloadResult<()> {
        rustix::fs::mkdir(path, Mode::from_raw_mode(mode)).op("mkdir")
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> PreloadResult<RawFd> {
        let owned = rustix::fs::open(path, flags.to_oflags(), Mode::from_raw_mode(mode)).op("open")?;
        Ok(self.adopt(owned))
    }

    fn fstat(&self, fd: RawFd) -> PreloadResult<FileStat> {
        let file = self.get(fd)?;
        let st = rustix::fs::fstat(&*file).op("fstat")?;
        Ok(FileStat::from_raw(&st))
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> PreloadResult<usize> {
        let file = self.get(fd)?;
        rustix::io::pread(&*file, buf, offset).op("pread")
    }

    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> PreloadResult<usize> {
        let file = self.get(fd)?;
        rustix::io::pwrite(&*file, buf, offset).op("pwrite")
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> PreloadResult<usize> {
        let file = self.get(fd)?;
        rustix::io::read(&*file, buf).op("read")
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> PreloadResult<usize> {
        let file = self.get(fd)?;
        rustix::io::write(&*file, buf).op("write")
    }

    fn close(&self, fd: RawFd) -> PreloadResult<()> {
        // The kernel descriptor is released once the last in-flight call
        // drops its clone.
        self.fds
            .lock()
            .remove(&fd)
            .map(drop)
            .ok_or(PreloadError::backend("close", Errno::BADF))
    }

    fn duplicate(&self, fd: RawFd, min: RawFd) -> PreloadResult<RawFd> {
        let file = self.get(fd)?;
        let owned = rustix::io::fcntl_dupfd_cloexec(&*file, min).op("dup")?;
        Ok(self.adopt(owned))
    }
}
