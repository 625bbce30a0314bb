//! Backend binding.
//!
//! Each backend is constructed at most once, on first use, behind a
//! one-time-initialization guard. Callers that arrive while construction is
//! in progress block until it finishes. A backend that cannot be built
//! leaves nothing sensible to forward to, so that is fatal.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{PreloadError, PreloadResult};
use crate::ops::FileOps;
use crate::types::BackendKind;

/// Builds a backend on first use.
pub type BackendFactory = Box<dyn Fn() -> PreloadResult<Arc<dyn FileOps>> + Send + Sync>;

/// A lazily resolved backend.
pub struct Binding {
    kind: BackendKind,
    factory: Option<BackendFactory>,
    slot: OnceLock<Arc<dyn FileOps>>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind)
            .field("backend", &self.slot.get().map(|ops| ops.name()))
            .finish()
    }
}

impl Binding {
    /// Bind `kind` to a backend built by `factory` on first resolution.
    pub fn lazy<F>(kind: BackendKind, factory: F) -> Self
    where
        F: Fn() -> PreloadResult<Arc<dyn FileOps>> + Send + Sync + 'static,
    {
        Self {
            kind,
            factory: Some(Box::new(factory)),
            slot: OnceLock::new(),
        }
    }

    /// Bind `kind` to an already constructed backend.
    pub fn ready(kind: BackendKind, ops: Arc<dyn FileOps>) -> Self {
        Self {
            kind,
            factory: None,
            slot: OnceLock::from(ops),
        }
    }

    /// Which backend this binding serves.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns true once the backend has been constructed.
    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Get the backend, constructing it if this is the first call.
    ///
    /// Aborts the process if construction fails.
    pub fn resolve(&self) -> &Arc<dyn FileOps> {
        self.slot.get_or_init(|| {
            let built = match &self.factory {
                Some(factory) => factory(),
                None => Err(PreloadError::config("binding has no backend")),
            };
            match built {
                Ok(ops) => {
                    tracing::debug!(kind = %self.kind, backend = ops.name(), "backend bound");
                    ops
                }
                Err(e) => fatal(&format!("cannot bind {} backend", self.kind), &e),
            }
        })
    }
}

/// Report an unrecoverable configuration error and abort.
pub(crate) fn fatal(context: &str, err: &PreloadError) -> ! {
    tracing::error!(error = %err, "{context}");
    eprintln!("pdlfs-preload: {context}: {err}");
    std::process::abort()
}
