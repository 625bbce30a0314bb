//! The intercepted file API.
//!
//! [`Preload`] owns the router, both backend bindings, and the descriptor
//! table. Path-taking calls are routed; descriptor- and stream-taking calls
//! go through the table. Each call reports failure as a [`PreloadError`]
//! whose [`errno`](PreloadError::errno) is the conventional error code.

use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backends::{NativeBackend, RootedBackend};
use crate::binding::{Binding, fatal};
use crate::config::PreloadConfig;
use crate::error::{PreloadError, PreloadResult};
use crate::logging;
use crate::ops::FileOps;
use crate::router::{PathRouter, Route};
use crate::stream::BufferedFile;
use crate::table::{DescriptorTable, FdMapping};
use crate::types::{BackendKind, FileStat, OpenFlags, StreamHandle, StreamState};

static GLOBAL: OnceLock<Preload> = OnceLock::new();

/// Routing and virtualization context.
#[derive(Debug)]
pub struct Preload {
    router: PathRouter,
    pdlfs: Binding,
    posix: Binding,
    table: DescriptorTable,
}

impl Preload {
    /// Build a context from configuration.
    ///
    /// The PDLFS backend is hosted under the configured root and the native
    /// backend talks to the kernel. Neither is constructed until first use.
    pub fn new(config: &PreloadConfig) -> PreloadResult<Self> {
        let router = PathRouter::new(&config.root)?;
        let root = router.root().to_string();

        let pdlfs = Binding::lazy(BackendKind::Pdlfs, move || {
            Ok(Arc::new(RootedBackend::new(root.clone())?) as Arc<dyn FileOps>)
        });
        let posix = Binding::lazy(BackendKind::Posix, || {
            Ok(Arc::new(NativeBackend::new()) as Arc<dyn FileOps>)
        });

        Ok(Self {
            router,
            pdlfs,
            posix,
            table: DescriptorTable::new(),
        })
    }

    /// Build a context over explicit backends.
    ///
    /// `posix` must be able to renumber descriptors for collisions to be
    /// resolved.
    pub fn with_backends(
        root: &str,
        pdlfs: Arc<dyn FileOps>,
        posix: Arc<dyn FileOps>,
    ) -> PreloadResult<Self> {
        Ok(Self {
            router: PathRouter::new(root)?,
            pdlfs: Binding::ready(BackendKind::Pdlfs, pdlfs),
            posix: Binding::ready(BackendKind::Posix, posix),
            table: DescriptorTable::new(),
        })
    }

    /// The process-wide context, configured from the environment on first
    /// use.
    ///
    /// An unusable configuration aborts the process.
    pub fn global() -> &'static Preload {
        GLOBAL.get_or_init(|| {
            let config = PreloadConfig::from_env();
            logging::init(config.verbosity);
            match Preload::new(&config) {
                Ok(preload) => {
                    debug!(root = preload.root(), "preload initialized");
                    preload
                }
                Err(e) => fatal("invalid preload configuration", &e),
            }
        })
    }

    /// The normalized root prefix.
    pub fn root(&self) -> &str {
        self.router.root()
    }

    /// Classify a path the way entry points do.
    pub fn route<'a>(&self, path: &'a str) -> PreloadResult<Route<'a>> {
        self.router.resolve(path)
    }

    fn backend(&self, kind: BackendKind) -> &Arc<dyn FileOps> {
        match kind {
            BackendKind::Pdlfs => self.pdlfs.resolve(),
            BackendKind::Posix => self.posix.resolve(),
        }
    }

    fn descriptor(&self, fd: RawFd, remove: bool) -> PreloadResult<(FdMapping, &Arc<dyn FileOps>)> {
        let mapping = self.table.lookup_fd(fd, remove)?;
        Ok((mapping, self.backend(mapping.backend)))
    }

    fn stream(&self, handle: StreamHandle) -> PreloadResult<Arc<Mutex<BufferedFile>>> {
        Ok(self.table.lookup_stream(handle, false)?.file)
    }

    // ========================================================================
    // Path operations
    // ========================================================================

    /// Create a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> PreloadResult<()> {
        let route = self.route(path)?;
        debug!(backend = %route.backend, path = %route.path, "mkdir");
        self.backend(route.backend).mkdir(&route.path, mode)
    }

    /// Open a file and return its virtual descriptor.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> PreloadResult<RawFd> {
        let route = self.route(path)?;
        debug!(backend = %route.backend, path = %route.path, ?flags, "open");

        let ops = self.backend(route.backend);
        let real = match route.backend {
            BackendKind::Pdlfs => ops.open_with_stat(&route.path, flags, mode)?.0,
            BackendKind::Posix => ops.open(&route.path, flags, mode)?,
        };

        let fd = self
            .table
            .allocate_fd(real, route.backend, self.posix.resolve().as_ref())?;
        trace!(fd, real, backend = %route.backend, "descriptor allocated");
        Ok(fd)
    }

    /// Create or truncate a file for writing.
    pub fn creat(&self, path: &str, mode: u32) -> PreloadResult<RawFd> {
        self.open(path, OpenFlags::creat(), mode)
    }

    // ========================================================================
    // Descriptor operations
    // ========================================================================

    /// Get metadata for an open descriptor.
    pub fn fstat(&self, fd: RawFd) -> PreloadResult<FileStat> {
        let (mapping, ops) = self.descriptor(fd, false)?;
        ops.fstat(mapping.real)
    }

    /// Read at `offset` without moving the descriptor's position.
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> PreloadResult<usize> {
        let (mapping, ops) = self.descriptor(fd, false)?;
        ops.pread(mapping.real, buf, offset)
    }

    /// Write at `offset` without moving the descriptor's position.
    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> PreloadResult<usize> {
        let (mapping, ops) = self.descriptor(fd, false)?;
        ops.pwrite(mapping.real, buf, offset)
    }

    /// Read at the descriptor's position.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> PreloadResult<usize> {
        let (mapping, ops) = self.descriptor(fd, false)?;
        ops.read(mapping.real, buf)
    }

    /// Write at the descriptor's position.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> PreloadResult<usize> {
        let (mapping, ops) = self.descriptor(fd, false)?;
        ops.write(mapping.real, buf)
    }

    /// Close a descriptor.
    ///
    /// The entry is gone from the table before the backend is asked to
    /// close, so no other call can reach a half-closed descriptor.
    pub fn close(&self, fd: RawFd) -> PreloadResult<()> {
        let (mapping, ops) = self.descriptor(fd, true)?;
        debug!(fd, backend = %mapping.backend, "close");
        ops.close(mapping.real)
    }

    // ========================================================================
    // Stream operations
    // ========================================================================

    /// Open a buffered stream with a mode such as `r`, `w+` or `a`.
    pub fn fopen(&self, path: &str, mode: &str) -> PreloadResult<StreamHandle> {
        let route = self.route(path)?;
        debug!(backend = %route.backend, path = %route.path, mode, "fopen");

        let file = BufferedFile::open(Arc::clone(self.backend(route.backend)), &route.path, mode)?;
        Ok(self.table.allocate_stream(route.backend, file))
    }

    /// Read from a stream.
    pub fn fread(&self, handle: StreamHandle, buf: &mut [u8]) -> PreloadResult<usize> {
        self.stream(handle)?.lock().read(buf)
    }

    /// Write to a stream.
    pub fn fwrite(&self, handle: StreamHandle, buf: &[u8]) -> PreloadResult<usize> {
        self.stream(handle)?.lock().write(buf)
    }

    /// Reposition a stream, returning the new offset.
    pub fn fseek(&self, handle: StreamHandle, pos: SeekFrom) -> PreloadResult<u64> {
        self.stream(handle)?.lock().seek(pos)
    }

    /// Current offset of a stream.
    pub fn ftell(&self, handle: StreamHandle) -> PreloadResult<u64> {
        Ok(self.stream(handle)?.lock().tell())
    }

    /// Write out a stream's pending bytes.
    pub fn fflush(&self, handle: StreamHandle) -> PreloadResult<()> {
        self.stream(handle)?.lock().flush(true)
    }

    /// Flush and close a stream.
    ///
    /// The handle is invalid afterwards even if the flush fails.
    pub fn fclose(&self, handle: StreamHandle) -> PreloadResult<()> {
        let entry = self.table.lookup_stream(handle, true)?;
        debug!(%handle, backend = %entry.backend, "fclose");
        entry.file.lock().close()
    }

    /// Clear a stream's error and end-of-file conditions.
    pub fn clearerr(&self, handle: StreamHandle) -> PreloadResult<()> {
        self.stream(handle)?.lock().clear_error();
        Ok(())
    }

    /// Returns true if the stream is in the error state.
    pub fn ferror(&self, handle: StreamHandle) -> PreloadResult<bool> {
        Ok(self.stream(handle)?.lock().is_error())
    }

    /// Returns true if a read on the stream reached end-of-file.
    pub fn feof(&self, handle: StreamHandle) -> PreloadResult<bool> {
        Ok(self.stream(handle)?.lock().is_eof())
    }

    /// Observable state of a stream.
    pub fn stream_state(&self, handle: StreamHandle) -> PreloadResult<StreamState> {
        Ok(self.stream(handle)?.lock().state())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Number of open virtual descriptors.
    pub fn open_fds(&self) -> usize {
        self.table.fd_count()
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.table.stream_count()
    }

    /// Close every open stream and descriptor.
    ///
    /// Streams are flushed first. Every handle is released even when some
    /// fail; the first error is returned.
    pub fn shutdown(&self) -> PreloadResult<()> {
        let (fds, streams) = self.table.drain();
        let mut first: Option<PreloadError> = None;

        for (handle, entry) in streams {
            if let Err(e) = entry.file.lock().close() {
                warn!(%handle, backend = %entry.backend, "close on shutdown failed: {e}");
                first.get_or_insert(e);
            }
        }
        for (fd, mapping) in fds {
            if let Err(e) = self.backend(mapping.backend).close(mapping.real) {
                warn!(fd, backend = %mapping.backend, "close on shutdown failed: {e}");
                first.get_or_insert(e);
            }
        }

        first.map_or(Ok(()), Err)
    }
}
