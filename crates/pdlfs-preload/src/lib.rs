//! # pdlfs-preload
//!
//! Transparent file I/O redirection between PDLFS and the native filesystem.
//!
//! Every path-taking call is classified against a root prefix:
//! - Paths under the root go to PDLFS, with the prefix stripped
//! - Everything else goes to the native filesystem unchanged
//! - Both backends share one integer descriptor namespace
//! - Buffered streams are rebuilt on top of positioned reads and writes,
//!   since PDLFS has nothing else
//!
//! [`Preload`] is the entry point. [`Preload::global`] gives the process-wide
//! context configured from `PDLFS_ROOT`; tests build their own.

pub mod backends;
pub mod binding;
pub mod config;
pub mod error;
pub mod logging;
pub mod ops;
pub mod preload;
pub mod router;
pub mod stream;
pub mod table;
pub mod types;

pub use backends::{MemoryBackend, NativeBackend, RootedBackend};
pub use binding::{BackendFactory, Binding};
pub use config::{DEFAULT_ROOT, PreloadConfig};
pub use error::{PreloadError, PreloadResult};
pub use ops::FileOps;
pub use preload::Preload;
pub use router::{PathRouter, Route};
pub use stream::BufferedFile;
pub use table::{DescriptorTable, FdMapping, StreamEntry};
pub use types::{BackendKind, FileStat, FileType, OpenFlags, StreamHandle, StreamState};

/// Re-exported so callers can inspect error codes without naming rustix.
pub use rustix::io::Errno;
