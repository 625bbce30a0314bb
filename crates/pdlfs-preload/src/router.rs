//! Path classification.
//!
//! Every path under the root prefix belongs to PDLFS, with the prefix
//! stripped. Everything else belongs to the native filesystem unchanged.

use std::borrow::Cow;

use crate::error::{PreloadError, PreloadResult};
use crate::types::BackendKind;

/// Where a path goes and what the owning backend calls it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    /// Owning backend.
    pub backend: BackendKind,
    /// Backend-relative path.
    pub path: Cow<'a, str>,
}

impl Route<'_> {
    /// Returns true if the path belongs to PDLFS.
    pub fn is_pdlfs(&self) -> bool {
        self.backend == BackendKind::Pdlfs
    }
}

/// Classifies paths against a fixed root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRouter {
    /// Normalized root: starts with `/`, no trailing slash, never `/` alone.
    root: String,
}

impl PathRouter {
    /// Create a router for the given root prefix.
    ///
    /// Trailing slashes are stripped so prefix comparisons stop at a
    /// component boundary. A relative root, or one that normalizes to `/`,
    /// is a configuration error.
    pub fn new(root: &str) -> PreloadResult<Self> {
        if !root.starts_with('/') {
            return Err(PreloadError::config(format!(
                "root must be an absolute path: {root:?}"
            )));
        }
        let trimmed = root.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(PreloadError::config(
                "root must not be the filesystem root",
            ));
        }
        Ok(Self {
            root: trimmed.to_string(),
        })
    }

    /// The normalized root prefix.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Classify an absolute path.
    ///
    /// Returns `None` for paths that are not absolute.
    pub fn classify<'a>(&self, path: &'a str) -> Option<Route<'a>> {
        if !path.starts_with('/') {
            return None;
        }

        let route = match path.strip_prefix(self.root.as_str()) {
            Some("") => Route {
                backend: BackendKind::Pdlfs,
                path: Cow::Borrowed("/"),
            },
            Some(rest) if rest.starts_with('/') => Route {
                backend: BackendKind::Pdlfs,
                path: Cow::Borrowed(rest),
            },
            _ => Route {
                backend: BackendKind::Posix,
                path: Cow::Borrowed(path),
            },
        };
        Some(route)
    }

    /// Classify a path as an entry point receives it.
    ///
    /// Relative paths are resolved against the root, which stands in for
    /// the working directory. An empty path is an invalid argument.
    pub fn resolve<'a>(&self, path: &'a str) -> PreloadResult<Route<'a>> {
        if path.is_empty() {
            return Err(PreloadError::invalid_argument("empty path"));
        }
        if let Some(route) = self.classify(path) {
            return Ok(route);
        }

        let absolute = format!("{}/{}", self.root, path);
        let route = self
            .classify(&absolute)
            .ok_or_else(|| PreloadError::invalid_argument(format!("cannot resolve {path:?}")))?;
        Ok(Route {
            backend: route.backend,
            path: Cow::Owned(route.path.into_owned()),
        })
    }
}
