//! Preload backends.
//!
//! Backends implement [`FileOps`](crate::FileOps) for the two storage systems
//! a path can route to.

mod memory;
mod native;
mod rooted;

pub use memory::MemoryBackend;
pub use native::NativeBackend;
pub use rooted::RootedBackend;
