//! Error handling for the key space engine.
//!
//! The engine distinguishes four failure classes, and only one of them is
//! fatal for a call:
//!
//! - **I/O absence** (missing topic, submap, or scheme file) is recorded on
//!   the affected node (`exists = false`) and traversal continues.
//! - **Structural anomalies** (circular map references, duplicate or
//!   unresolved keys, malformed markup) are surfaced as flags on the
//!   resulting nodes and definitions, never as errors.
//! - **Resource-exhaustion guards** (reference-match ceiling) truncate
//!   processing and return the partial result.
//! - **Root build failure** (the root map itself cannot be read) is the
//!   fatal case, represented by [`KeySpaceError::RootMapUnreadable`] and
//!   propagated to every caller awaiting that build.
//!
//! Typed failures live in [`KeySpaceError`]; API seams use
//! [`anyhow::Result`] with context, matching how call sites consume them.

use std::path::PathBuf;
use thiserror::Error;

/// Typed errors for key space construction and configuration.
#[derive(Error, Debug)]
pub enum KeySpaceError {
    /// The root map of a build could not be read at all.
    ///
    /// This is the only fatal parse-side error: submaps that cannot be read
    /// become non-existent nodes instead.
    #[error("cannot read root map '{}': {reason}", path.display())]
    RootMapUnreadable {
        /// Path of the root map that failed to load
        path: PathBuf,
        /// Underlying I/O failure, already rendered
        reason: String,
    },

    /// A configuration source could not be loaded or was invalid.
    #[error("configuration error: {message}")]
    ConfigError {
        /// What went wrong, suitable for display
        message: String,
    },

    /// A shared in-flight build failed; every waiter observes this equally.
    #[error("key space build for '{}' failed: {reason}", root_map.display())]
    BuildFailed {
        /// Root map whose build failed
        root_map: PathBuf,
        /// Rendered failure of the originating build
        reason: String,
    },

    /// Standard I/O errors from [`std::io::Error`].
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing errors from configuration files.
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}
