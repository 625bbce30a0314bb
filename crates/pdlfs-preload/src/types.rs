//! Core preload types.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which storage system services a path or handle.
///
/// Immutable per open handle once assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The PDLFS namespace under the configured root.
    Pdlfs,
    /// The native local filesystem.
    Posix,
}

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Anything else (fifo, socket, device).
    Other,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Descriptor metadata as reported by a backend's `fstat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Permission bits (e.g., 0o644).
    pub perm: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Last modification time, if known.
    pub mtime: Option<SystemTime>,
}

impl FileStat {
    /// Stat for a regular file of the given size.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            mtime: Some(SystemTime::now()),
        }
    }

    /// Build a stat from a kernel `struct stat`.
    pub fn from_raw(st: &rustix::fs::Stat) -> Self {
        let kind = match rustix::fs::FileType::from_raw_mode(st.st_mode as _) {
            rustix::fs::FileType::RegularFile => FileType::File,
            rustix::fs::FileType::Directory => FileType::Directory,
            rustix::fs::FileType::Symlink => FileType::Symlink,
            _ => FileType::Other,
        };
        let mtime = u64::try_from(st.st_mtime)
            .ok()
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::new(secs, st.st_mtime_nsec as u32));

        Self {
            size: st.st_size as u64,
            kind,
            perm: (st.st_mode as u32) & 0o7777,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            mtime,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with read/write access.
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::read_write()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate, read/write.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }

    /// The flags `creat(2)` implies: create, write-only, truncate.
    pub fn creat() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Parse a stream open mode (`r`, `r+`, `w`, `w+`, `a`, `a+`).
    ///
    /// A `b` anywhere after the first character is accepted and ignored.
    /// Append modes set [`OpenFlags::append`] for the buffering layer; the
    /// backend is never opened with an append flag for streams.
    pub fn from_mode(mode: &str) -> Option<Self> {
        let mut chars = mode.chars();
        let primary = chars.next()?;
        let mut plus = false;
        for c in chars {
            match c {
                '+' if !plus => plus = true,
                'b' => {}
                _ => return None,
            }
        }

        let flags = match (primary, plus) {
            ('r', false) => Self::read(),
            ('r', true) => Self::read_write(),
            ('w', false) => Self::creat(),
            ('w', true) => Self::create_truncate(),
            ('a', false) => Self {
                read: false,
                write: true,
                create: true,
                append: true,
                ..Default::default()
            },
            ('a', true) => Self {
                append: true,
                ..Self::create()
            },
            _ => return None,
        };
        Some(flags)
    }

    /// The same flags with the append bit cleared.
    pub fn without_append(self) -> Self {
        Self {
            append: false,
            ..self
        }
    }

    /// Translate into kernel open flags.
    pub fn to_oflags(self) -> rustix::fs::OFlags {
        use rustix::fs::OFlags;

        let mut flags = match (self.read, self.write) {
            (_, false) => OFlags::RDONLY,
            (false, true) => OFlags::WRONLY,
            (true, true) => OFlags::RDWR,
        };
        if self.append {
            flags |= OFlags::APPEND;
        }
        if self.create {
            flags |= OFlags::CREATE;
        }
        if self.truncate {
            flags |= OFlags::TRUNC;
        }
        if self.exclusive {
            flags |= OFlags::EXCL;
        }
        flags | OFlags::CLOEXEC
    }
}

/// Application-visible identity of an open buffered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub(crate) u64);

impl StreamHandle {
    /// The raw handle value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Observable state of a buffered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No pending writes, no sticky condition.
    Clean,
    /// Pending write region not yet flushed.
    Dirty,
    /// A read hit end-of-file; sticky until cleared.
    Eof,
    /// An I/O error occurred; sticky until cleared.
    Error,
    /// The stream has been closed.
    Closed,
}
