//! Descriptor virtualization table.
//!
//! One integer namespace is shared by both backends. Native descriptors keep
//! their own number when it is free; PDLFS descriptors always get a fresh
//! synthetic number. The lock guards bookkeeping only and is never held
//! across a backend call.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::stream::BufferedFile;
use crate::types::{BackendKind, StreamHandle};

/// Highest descriptor number that is never issued fresh (stderr).
const RESERVED_MAX: RawFd = 2;

/// What an application-visible descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdMapping {
    /// Owning backend.
    pub backend: BackendKind,
    /// Descriptor in the backend's own namespace.
    pub real: RawFd,
}

/// What a stream handle refers to.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Owning backend.
    pub backend: BackendKind,
    /// The stream itself, shared with in-flight calls.
    pub file: Arc<Mutex<BufferedFile>>,
}

#[derive(Debug)]
struct Inner {
    fds: HashMap<RawFd, FdMapping>,
    streams: HashMap<StreamHandle, StreamEntry>,
    /// Highest descriptor ever issued. Only grows.
    highest: RawFd,
    next_stream: u64,
}

impl Inner {
    fn reserve_fd(&mut self) -> RawFd {
        self.highest += 1;
        self.highest
    }
}

/// Maps virtual descriptors and stream handles to backend handles.
#[derive(Debug)]
pub struct DescriptorTable {
    inner: Mutex<Inner>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                fds: HashMap::new(),
                streams: HashMap::new(),
                highest: RESERVED_MAX,
                next_stream: 0,
            }),
        }
    }

    /// Register a backend descriptor and return its virtual number.
    ///
    /// A native descriptor whose number is already taken is renumbered above
    /// everything issued so far with `native.duplicate`, and the original
    /// is closed. If renumbering fails the original is closed too and the
    /// backend error is returned.
    pub fn allocate_fd(
        &self,
        real: RawFd,
        backend: BackendKind,
        native: &dyn FileOps,
    ) -> PreloadResult<RawFd> {
        if backend == BackendKind::Pdlfs {
            let mut inner = self.inner.lock();
            let vid = inner.reserve_fd();
            inner.fds.insert(vid, FdMapping { backend, real });
            return Ok(vid);
        }

        let mut candidate = real;
        loop {
            let floor = {
                let mut inner = self.inner.lock();
                if !inner.fds.contains_key(&candidate) {
                    inner.highest = inner.highest.max(candidate);
                    inner.fds.insert(
                        candidate,
                        FdMapping {
                            backend,
                            real: candidate,
                        },
                    );
                    break;
                }
                inner.reserve_fd()
            };

            // A previous duplicate lost a race for its number.
            if candidate != real {
                if let Err(e) = native.close(candidate) {
                    tracing::warn!(fd = candidate, "failed to close stale duplicate: {e}");
                }
            }

            match native.duplicate(real, floor) {
                Ok(fd) => {
                    tracing::trace!(real, fd, "renumbered colliding descriptor");
                    candidate = fd;
                }
                Err(e) => {
                    if let Err(close_err) = native.close(real) {
                        tracing::warn!(
                            real,
                            "failed to close unplaceable descriptor: {close_err}"
                        );
                    }
                    return Err(e);
                }
            }
        }

        if candidate != real {
            if let Err(e) = native.close(real) {
                tracing::warn!(real, "failed to close renumbered descriptor: {e}");
            }
        }
        Ok(candidate)
    }

    /// Look up a virtual descriptor, optionally removing it in the same step.
    pub fn lookup_fd(&self, vid: RawFd, remove: bool) -> PreloadResult<FdMapping> {
        let mut inner = self.inner.lock();
        let found = if remove {
            inner.fds.remove(&vid)
        } else {
            inner.fds.get(&vid).copied()
        };
        found.ok_or(PreloadError::UnknownDescriptor(vid))
    }

    /// Register an open stream and return its handle.
    pub fn allocate_stream(&self, backend: BackendKind, file: BufferedFile) -> StreamHandle {
        let mut inner = self.inner.lock();
        inner.next_stream += 1;
        let handle = StreamHandle(inner.next_stream);
        inner.streams.insert(
            handle,
            StreamEntry {
                backend,
                file: Arc::new(Mutex::new(file)),
            },
        );
        handle
    }

    /// Look up a stream, optionally removing it in the same step.
    pub fn lookup_stream(&self, handle: StreamHandle, remove: bool) -> PreloadResult<StreamEntry> {
        let mut inner = self.inner.lock();
        let found = if remove {
            inner.streams.remove(&handle)
        } else {
            inner.streams.get(&handle).cloned()
        };
        found.ok_or(PreloadError::UnknownStream(handle))
    }

    /// Number of live descriptors.
    pub fn fd_count(&self) -> usize {
        self.inner.lock().fds.len()
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Highest descriptor number issued so far.
    pub fn highest_issued(&self) -> RawFd {
        self.inner.lock().highest
    }

    /// Remove every live entry, in ascending order.
    pub fn drain(&self) -> (Vec<(RawFd, FdMapping)>, Vec<(StreamHandle, StreamEntry)>) {
        let mut inner = self.inner.lock();
        let mut fds: Vec<_> = inner.fds.drain().collect();
        let mut streams: Vec<_> = inner.streams.drain().collect();
        drop(inner);

        fds.sort_by_key(|(vid, _)| *vid);
        streams.sort_by_key(|(handle, _)| *handle);
        (fds, streams)
    }
}
