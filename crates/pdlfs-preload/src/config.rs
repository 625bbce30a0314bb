//! Preload configuration.
//!
//! Read once per process from the environment. The root is kept as given;
//! normalization and validation happen when the router is built.

use serde::{Deserialize, Serialize};

/// Root used when no root is configured.
pub const DEFAULT_ROOT: &str = "/tmp/pdlfs";

/// Environment variable naming the root prefix.
pub const ROOT_ENV: &str = "PDLFS_ROOT";

/// Alternate spelling accepted for the root prefix.
pub const ROOT_ENV_ALT: &str = "PDLFS_Root";

/// Environment variable for diagnostic verbosity.
pub const VERBOSE_ENV: &str = "PDLFS_Verbose";

/// Process-wide preload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Absolute path prefix redirected to the PDLFS backend.
    pub root: String,

    /// Diagnostic verbosity (0 = warnings only).
    #[serde(default)]
    pub verbosity: u8,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl PreloadConfig {
    /// Create a config with the given root and no extra verbosity.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            verbosity: 0,
        }
    }

    /// Set verbosity.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup.
    ///
    /// An unset or empty root falls back to [`DEFAULT_ROOT`]. A verbosity
    /// that does not parse counts as 0.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = [ROOT_ENV, ROOT_ENV_ALT]
            .into_iter()
            .filter_map(&lookup)
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());

        let verbosity = lookup(VERBOSE_ENV)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);

        Self { root, verbosity }
    }
}
