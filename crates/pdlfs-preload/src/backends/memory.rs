//! In-memory backend.
//!
//! Used for testing. All data is ephemeral. Descriptors are numbered from 3
//! in their own namespace, so they overlap native descriptor numbers the
//! same way a real PDLFS client's would.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustix::io::Errno;

use crate::error::{PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::types::{FileStat, FileType, OpenFlags};

/// First descriptor number handed out.
const FIRST_FD: RawFd = 3;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, perm: u32 },
    Directory { perm: u32 },
}

/// An open descriptor.
#[derive(Debug, Clone)]
struct OpenFile {
    path: String,
    read: bool,
    write: bool,
    append: bool,
    pos: u64,
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,
    fds: HashMap<RawFd, OpenFile>,
    next_fd: RawFd,
}

/// Injected write behavior.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    /// Accept at most this many bytes per write call.
    write_limit: Option<usize>,
    /// Fail every write call with this errno.
    write_error: Option<Errno>,
}

/// In-memory backend.
///
/// Thread-safe via internal `RwLock`. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBackend {
    state: RwLock<State>,
    faults: RwLock<Faults>,
    pwrite_calls: AtomicUsize,
    pread_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert("/".to_string(), Entry::Directory { perm: 0o755 });
        Self {
            state: RwLock::new(State {
                entries,
                fds: HashMap::new(),
                next_fd: FIRST_FD,
            }),
            faults: RwLock::new(Faults::default()),
            pwrite_calls: AtomicUsize::new(0),
            pread_calls: AtomicUsize::new(0),
        }
    }

    /// Accept at most `limit` bytes per write call (`None` for no limit).
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.faults.write().write_limit = limit;
    }

    /// Fail every write call with `errno` (`None` to stop failing).
    pub fn set_write_error(&self, errno: Option<Errno>) {
        self.faults.write().write_error = errno;
    }

    /// Number of positioned and sequential write calls served so far.
    pub fn write_calls(&self) -> usize {
        self.pwrite_calls.load(Ordering::Relaxed)
    }

    /// Number of positioned and sequential read calls served so far.
    pub fn read_calls(&self) -> usize {
        self.pread_calls.load(Ordering::Relaxed)
    }

    /// Number of descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.state.read().fds.len()
    }

    /// Contents of a file, if it exists.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = Self::normalize(path);
        match self.state.read().entries.get(&path) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Normalize a path: single leading `/`, no empty or `.` components.
    fn normalize(path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &path[..i],
        }
    }

    fn check_parent(state: &State, path: &str) -> PreloadResult<()> {
        match state.entries.get(Self::parent(path)) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(PreloadError::backend("lookup", Errno::NOTDIR)),
            None => Err(PreloadError::backend("lookup", Errno::NOENT)),
        }
    }

    fn descriptor(state: &State, fd: RawFd, op: &'static str) -> PreloadResult<OpenFile> {
        state
            .fds
            .get(&fd)
            .cloned()
            .ok_or(PreloadError::backend(op, Errno::BADF))
    }

    fn read_at(&self, fd: RawFd, buf: &mut [u8], offset: Option<u64>) -> PreloadResult<usize> {
        self.pread_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();
        let file = Self::descriptor(&state, fd, "pread")?;
        if !file.read {
            return Err(PreloadError::backend("pread", Errno::BADF));
        }

        let pos = offset.unwrap_or(file.pos);
        let n = match state.entries.get(&file.path) {
            Some(Entry::File { data, .. }) => {
                let start = (pos as usize).min(data.len());
                let end = (start + buf.len()).min(data.len());
                buf[..end - start].copy_from_slice(&data[start..end]);
                end - start
            }
            Some(Entry::Directory { .. }) => {
                return Err(PreloadError::backend("pread", Errno::ISDIR));
            }
            None => return Err(PreloadError::backend("pread", Errno::NOENT)),
        };

        if offset.is_none() {
            if let Some(open) = state.fds.get_mut(&fd) {
                open.pos = pos + n as u64;
            }
        }
        Ok(n)
    }

    fn write_at(&self, fd: RawFd, buf: &[u8], offset: Option<u64>) -> PreloadResult<usize> {
        self.pwrite_calls.fetch_add(1, Ordering::Relaxed);
        let faults = *self.faults.read();
        if let Some(errno) = faults.write_error {
            return Err(PreloadError::backend("pwrite", errno));
        }

        let mut state = self.state.write();
        let file = Self::descriptor(&state, fd, "pwrite")?;
        if !file.write {
            return Err(PreloadError::backend("pwrite", Errno::BADF));
        }

        let len = faults.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        let end = match state.entries.get_mut(&file.path) {
            Some(Entry::File { data, .. }) => {
                let pos = match offset {
                    Some(off) => off as usize,
                    None if file.append => data.len(),
                    None => file.pos as usize,
                };
                let end = pos + len;
                if end > data.len() {
                    data.resize(end, 0);
                }
                data[pos..end].copy_from_slice(&buf[..len]);
                end
            }
            Some(Entry::Directory { .. }) => {
                return Err(PreloadError::backend("pwrite", Errno::ISDIR));
            }
            None => return Err(PreloadError::backend("pwrite", Errno::NOENT)),
        };

        if offset.is_none() {
            if let Some(open) = state.fds.get_mut(&fd) {
                open.pos = end as u64;
            }
        }
        Ok(len)
    }
}

impl FileOps for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn mkdir(&self, path: &str, mode: u32) -> PreloadResult<()> {
        let path = Self::normalize(path);
        let mut state = self.state.write();
        if state.entries.contains_key(&path) {
            return Err(PreloadError::backend("mkdir", Errno::EXIST));
        }
        Self::check_parent(&state, &path)?;
        state
            .entries
            .insert(path, Entry::Directory { perm: mode & 0o7777 });
        Ok(())
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> PreloadResult<RawFd> {
        let path = Self::normalize(path);
        let mut state = self.state.write();

        match state.entries.get_mut(&path) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(PreloadError::backend("open", Errno::EXIST));
            }
            Some(Entry::Directory { .. }) if flags.write => {
                return Err(PreloadError::backend("open", Errno::ISDIR));
            }
            Some(Entry::File { data, .. }) => {
                if flags.truncate && flags.write {
                    data.clear();
                }
            }
            Some(Entry::Directory { .. }) => {}
            None if flags.create => {
                Self::check_parent(&state, &path)?;
                state.entries.insert(
                    path.clone(),
                    Entry::File {
                        data: Vec::new(),
                        perm: mode & 0o7777,
                    },
                );
            }
            None => return Err(PreloadError::backend("open", Errno::NOENT)),
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(
            fd,
            OpenFile {
                path,
                read: flags.read,
                write: flags.write,
                append: flags.append,
                pos: 0,
            },
        );
        Ok(fd)
    }

    fn fstat(&self, fd: RawFd) -> PreloadResult<FileStat> {
        let state = self.state.read();
        let file = Self::descriptor(&state, fd, "fstat")?;
        match state.entries.get(&file.path) {
            Some(Entry::File { data, perm }) => Ok(FileStat::file(data.len() as u64, *perm)),
            Some(Entry::Directory { perm }) => Ok(FileStat {
                size: 0,
                kind: FileType::Directory,
                nlink: 2,
                ..FileStat::file(0, *perm)
            }),
            None => Err(PreloadError::backend("fstat", Errno::NOENT)),
        }
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> PreloadResult<usize> {
        self.read_at(fd, buf, Some(offset))
    }

    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> PreloadResult<usize> {
        self.write_at(fd, buf, Some(offset))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> PreloadResult<usize> {
        self.read_at(fd, buf, None)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> PreloadResult<usize> {
        self.write_at(fd, buf, None)
    }

    fn close(&self, fd: RawFd) -> PreloadResult<()> {
        self.state
            .write()
            .fds
            .remove(&fd)
            .map(drop)
            .ok_or(PreloadError::backend("close", Errno::BADF))
    }
}
