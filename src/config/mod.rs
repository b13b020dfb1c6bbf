//! Engine configuration: snapshots, providers, and hot reload.
//!
//! The host environment owns the settings (cache TTL, cache size, the
//! reference-match ceiling, an optional workspace boundary) and may change
//! them at runtime. To avoid torn reads during a build, the engine never
//! consults live settings mid-operation: it captures an [`EngineConfig`]
//! snapshot when a cache entry or build starts and uses that snapshot
//! throughout. `reload_cache_config()` swaps in a fresh snapshot for future
//! work; entries created under the old snapshot keep their original TTL.
//!
//! Two providers are included:
//! - [`StaticProvider`]: an in-memory settings object the host mutates
//!   directly (also what tests use).
//! - [`TomlFileProvider`]: reads a TOML file on every reload.
//!
//! # File Format
//!
//! ```toml
//! ttl-minutes = 5
//! max-cache-entries = 10
//! max-reference-matches = 10000
//! workspace-root = "/home/user/docs"
//! ```

use crate::core::KeySpaceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

/// Default cache entry lifetime in minutes.
pub const DEFAULT_TTL_MINUTES: u64 = 5;

/// Default maximum number of cached key spaces.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10;

/// Default ceiling on reference matches processed per document.
pub const DEFAULT_MAX_REFERENCE_MATCHES: usize = 10_000;

/// An immutable snapshot of engine settings.
///
/// Cloned freely; captured once per build or cache insertion and never
/// consulted live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Cache entry lifetime, in minutes.
    pub ttl_minutes: u64,

    /// Millisecond-precision TTL override.
    ///
    /// Hosts that need sub-minute expiry (short-lived preview sessions,
    /// tests) set this; when present it takes precedence over
    /// `ttl_minutes`.
    pub ttl_millis: Option<u64>,

    /// Maximum number of key spaces held in the cache at once.
    pub max_cache_entries: usize,

    /// Ceiling on reference matches processed per document.
    ///
    /// Bounds work against pathological inputs; scanning stops (with a
    /// warning) once the ceiling is hit and the partial result is kept.
    pub max_reference_matches: usize,

    /// Optional workspace boundary.
    ///
    /// When set, any href resolution escaping this directory is rejected:
    /// the key stays in the table but without a usable target file.
    pub workspace_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: DEFAULT_TTL_MINUTES,
            ttl_millis: None,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            max_reference_matches: DEFAULT_MAX_REFERENCE_MATCHES,
            workspace_root: None,
        }
    }
}

impl EngineConfig {
    /// Cache TTL as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        match self.ttl_millis {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.ttl_minutes * 60),
        }
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`KeySpaceError::TomlError`] on invalid TOML.
    pub fn from_toml(text: &str) -> Result<Self, KeySpaceError> {
        Ok(toml::from_str(text)?)
    }
}

/// Source of configuration snapshots.
///
/// The cache calls [`ConfigProvider::load`] at construction and again on
/// every `reload_cache_config()`.
pub trait ConfigProvider: Send + Sync {
    /// Produce the current configuration snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`KeySpaceError::ConfigError`] (or an I/O / parse variant)
    /// when the settings cannot be read; the cache keeps its previous
    /// snapshot in that case.
    fn load(&self) -> Result<EngineConfig, KeySpaceError>;
}

/// In-memory provider backed by a mutable settings object.
#[derive(Debug, Default)]
pub struct StaticProvider {
    current: RwLock<EngineConfig>,
}

impl StaticProvider {
    /// Create a provider serving the given settings.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    /// Replace the settings served to future `load` calls.
    ///
    /// Existing snapshots held by the engine are unaffected until it
    /// reloads.
    pub fn update(&self, config: EngineConfig) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = config;
    }
}

impl ConfigProvider for StaticProvider {
    fn load(&self) -> Result<EngineConfig, KeySpaceError> {
        Ok(self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Provider that re-reads a TOML file on every load.
#[derive(Debug)]
pub struct TomlFileProvider {
    path: PathBuf,
}

impl TomlFileProvider {
    /// Create a provider for the given settings file.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigProvider for TomlFileProvider {
    fn load(&self) -> Result<EngineConfig, KeySpaceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| KeySpaceError::ConfigError {
            message: format!("cannot read '{}': {}", self.path.display(), e),
        })?;
        EngineConfig::from_toml(&text)
    }
}
