//! The resolver facade, the engine's single entry point for consumers.
//!
//! Link providers, validators, and transclusion resolvers hand
//! [`KeyResolver`] a symbolic key plus the path of the document referencing
//! it. The resolver locates the owning root map, obtains that root's
//! [`KeySpace`] through the cache, and returns the retained definition.
//!
//! # Owning-root discovery
//!
//! How an arbitrary context file maps back to its root map is deliberately a
//! pluggable strategy ([`RootMapStrategy`]):
//!
//! - [`WorkspaceScan`] (default) walks ancestor directories of the context
//!   file looking for the nearest map that mentions it, falling back to the
//!   context file itself when it is a map. The climb stops at the workspace
//!   boundary and is always capped at a fixed number of levels; candidate
//!   maps are read asynchronously like every other engine read.
//! - [`ExplicitRoot`] pins a single configured root, for hosts that already
//!   know it.
//!
//! Discovery results are memoized per context file; `clear_cache()` drops
//! that memo along with the key space cache itself.

use crate::cache::{CacheStats, KeySpaceCache};
use crate::core::KeySpaceError;
use crate::keyspace::{KeyDefinition, KeySpace};
use crate::utils::fs::read_text_lossy;
use crate::utils::paths::{absolutize, is_map_file, within_boundary};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// How many ancestor directories [`WorkspaceScan`] climbs before giving up.
const MAX_ANCESTOR_LEVELS: usize = 10;

/// Boxed future returned by [`RootMapStrategy::find_root_map`], keeping the
/// trait object-safe while discovery performs asynchronous reads.
pub type RootMapFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<PathBuf>>> + Send + 'a>>;

/// Maps a context file back to the root map that owns it.
pub trait RootMapStrategy: Send + Sync {
    /// Find the owning root map for `context_file`, or `None` when the file
    /// belongs to no known hierarchy.
    ///
    /// # Errors
    ///
    /// Only for genuine failures (e.g. an unreadable candidate directory);
    /// "not found" is `Ok(None)`.
    fn find_root_map<'a>(&'a self, context_file: &'a Path) -> RootMapFuture<'a>;
}

/// Strategy for hosts that already know the root map.
pub struct ExplicitRoot {
    root: PathBuf,
}

impl ExplicitRoot {
    /// Pin every lookup to the given root map.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl RootMapStrategy for ExplicitRoot {
    fn find_root_map<'a>(&'a self, _context_file: &'a Path) -> RootMapFuture<'a> {
        let root = self.root.clone();
        Box::pin(async move { Ok(Some(root)) })
    }
}

/// Nearest-ancestor scan: climb from the context file's directory, checking
/// each level for a map document that references the file by name.
///
/// A context file outside the configured boundary belongs to no hierarchy.
/// The climb stops at the boundary and is always capped at
/// [`MAX_ANCESTOR_LEVELS`]; candidate maps are read asynchronously. A
/// context file that is itself a map and is referenced by no other map
/// becomes its own root.
pub struct WorkspaceScan {
    boundary: Option<PathBuf>,
}

impl WorkspaceScan {
    /// Create a scan bounded by `boundary` (level-capped either way).
    #[must_use]
    pub fn new(boundary: Option<PathBuf>) -> Self {
        Self { boundary }
    }

    /// Map files in one directory, sorted for deterministic picks.
    fn maps_in(dir: &Path) -> Vec<PathBuf> {
        let mut maps: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file() && is_map_file(e.path()))
            .map(|e| e.path().to_path_buf())
            .collect();
        maps.sort();
        maps
    }

    /// Cheap containment check: does the map text mention the file name?
    ///
    /// Hrefs always carry the basename, so a substring probe is enough here;
    /// the key space build re-resolves everything properly.
    async fn map_references(map: &Path, basename: &str) -> bool {
        read_text_lossy(map)
            .await
            .map(|content| content.contains(basename))
            .unwrap_or(false)
    }

    async fn scan(&self, context: PathBuf) -> Result<Option<PathBuf>> {
        let Some(basename) = context.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if let Some(boundary) = self.boundary.as_deref()
            && !within_boundary(&context, boundary)
        {
            debug!(
                context = %context.display(),
                boundary = %boundary.display(),
                "context file outside workspace boundary"
            );
            return Ok(None);
        }

        let mut dir = context.parent();
        let mut level = 0;
        while let Some(current) = dir {
            for map in Self::maps_in(current) {
                if map != context && Self::map_references(&map, basename).await {
                    trace!(
                        context = %context.display(),
                        root = %map.display(),
                        "owning map found by ancestor scan"
                    );
                    return Ok(Some(map));
                }
            }

            if self.boundary.as_deref() == Some(current) {
                break;
            }
            level += 1;
            if level >= MAX_ANCESTOR_LEVELS {
                break;
            }
            dir = current.parent();
        }

        if is_map_file(&context) {
            return Ok(Some(context));
        }
        Ok(None)
    }
}

impl RootMapStrategy for WorkspaceScan {
    fn find_root_map<'a>(&'a self, context_file: &'a Path) -> RootMapFuture<'a> {
        let context = absolutize(context_file);
        Box::pin(async move { self.scan(context?).await })
    }
}

/// The public facade over root discovery, the key space cache, and lookups.
pub struct KeyResolver {
    cache: Arc<KeySpaceCache>,
    strategy: Box<dyn RootMapStrategy>,
    owning_roots: DashMap<PathBuf, PathBuf>,
}

impl KeyResolver {
    /// Create a resolver over `cache` using the given discovery strategy.
    #[must_use]
    pub fn new(cache: Arc<KeySpaceCache>, strategy: Box<dyn RootMapStrategy>) -> Self {
        Self {
            cache,
            strategy,
            owning_roots: DashMap::new(),
        }
    }

    /// Resolve a key as seen from `context_file`.
    ///
    /// Returns `Ok(None)` when the context belongs to no hierarchy or the
    /// key is not defined in it. Unresolved keys are returned as
    /// definitions with an [`Unresolved`](crate::keyspace::KeyTarget)
    /// target, not collapsed into `None`.
    ///
    /// # Errors
    ///
    /// Fails when the owning root map exists but cannot be built (shared
    /// identically across concurrent callers).
    pub async fn resolve_key(
        &self,
        key_name: &str,
        context_file: &Path,
    ) -> Result<Option<KeyDefinition>> {
        let Some(root) = self.owning_root(context_file).await? else {
            debug!(context = %context_file.display(), "no owning root map");
            return Ok(None);
        };
        let space = self
            .cache
            .get_or_build(&root)
            .await
            .with_context(|| format!("resolving key '{key_name}'"))?;
        Ok(space.get(key_name).cloned())
    }

    /// Build (or fetch) the key space for an explicit root map.
    ///
    /// # Errors
    ///
    /// Propagates the build failure for that root.
    pub async fn build_key_space(&self, root_map: &Path) -> Result<Arc<KeySpace>, KeySpaceError> {
        self.cache.get_or_build(root_map).await
    }

    /// Current cache statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop all cached key spaces and all memoized owning-root lookups.
    pub fn clear_cache(&self) {
        self.owning_roots.clear();
        self.cache.clear();
    }

    /// Re-read cache settings from the configuration provider.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure; previous settings stay active.
    pub fn reload_cache_config(&self) -> Result<(), KeySpaceError> {
        self.cache.reload_config()
    }

    /// Release background resources. Safe to call more than once.
    pub fn dispose(&self) {
        self.owning_roots.clear();
        self.cache.dispose();
    }

    async fn owning_root(&self, context_file: &Path) -> Result<Option<PathBuf>> {
        let context = absolutize(context_file)?;
        if let Some(root) = self.owning_roots.get(&context) {
            return Ok(Some(root.clone()));
        }
        let found = self.strategy.find_root_map(&context).await?;
        if let Some(root) = &found {
            self.owning_roots.insert(context, root.clone());
        }
        Ok(found)
    }
}
