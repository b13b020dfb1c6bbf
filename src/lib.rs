//! dita-keyspace - Key Space Resolution & Caching Engine for DITA
//!
//! This crate resolves DITA keys: the named indirection that maps a symbolic
//! key to a target file, a content fragment, or an inline value. Given any
//! document in a hierarchy of map files, it discovers the owning root map,
//! recursively parses the tree of map and submap references, merges the key
//! definitions it finds under DITA's first-wins scoping precedence, and
//! serves lookups through a TTL/LRU cache with single-flight build
//! deduplication.
//!
//! # Architecture Overview
//!
//! Leaves first:
//!
//! - [`parser`] - extracts an ordered tree of reference nodes (submaps, key
//!   definitions, topic references) from map markup, ignoring commented-out
//!   elements and neutralizing cycles
//! - [`keyspace`] - walks the hierarchy depth-first and folds key
//!   definitions into one ordered, first-wins symbol table per root map
//! - [`cache`] - bounds those tables with per-entry TTL, LRU eviction, and
//!   request coalescing so concurrent rebuilds of one root share one build
//! - [`resolver`] - the facade consumers call: key + context file in,
//!   definition out, with pluggable owning-root discovery
//! - [`scheme`] - the subject scheme overlay: controlled attribute values
//!   and defaults drawn from registered scheme maps
//! - [`config`] - snapshot-based settings with a hot-reload hook
//! - [`core`] - the error taxonomy
//! - [`utils`] - tolerant file reading and path normalization/boundary
//!   checks
//!
//! # Key Guarantees
//!
//! - **First-wins merging**: for a key defined more than once across a
//!   hierarchy, the retained definition is the first in traversal order
//!   (root document order, depth-first into submaps where they appear).
//! - **Cycle safety**: a map referencing an already-visited map produces a
//!   flagged node, never infinite recursion; every visited map appears in
//!   the hierarchy exactly once.
//! - **Single-flight**: N concurrent builds of one root map yield N results
//!   with an identical `build_time` and one cache entry.
//! - **Bounded everything**: cache size is capped with LRU eviction,
//!   per-document reference scanning is capped by a configurable ceiling,
//!   and binary/huge/empty inputs degrade to empty results instead of
//!   failures.
//!
//! # Usage
//!
//! ```rust,no_run
//! use dita_keyspace::cache::KeySpaceCache;
//! use dita_keyspace::config::{EngineConfig, StaticProvider};
//! use dita_keyspace::resolver::{KeyResolver, WorkspaceScan};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = Arc::new(StaticProvider::new(EngineConfig::default()));
//! let cache = KeySpaceCache::new(provider)?;
//! let resolver = KeyResolver::new(cache, Box::new(WorkspaceScan::new(None)));
//!
//! if let Some(def) = resolver
//!     .resolve_key("product-name", Path::new("/docs/topics/install.dita"))
//!     .await?
//! {
//!     println!("{:?}", def.target);
//! }
//! # Ok(())
//! # }
//! ```

// Core engine modules
pub mod cache;
pub mod core;
pub mod keyspace;
pub mod parser;
pub mod resolver;

// Overlay
pub mod scheme;

// Supporting modules
pub mod config;
pub mod utils;
