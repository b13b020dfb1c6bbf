//! Shared test fixtures: a throwaway workspace of DITA maps and topics.

#![allow(dead_code)]

use anyhow::Result;
use dita_keyspace::cache::KeySpaceCache;
use dita_keyspace::config::{EngineConfig, StaticProvider};
use dita_keyspace::resolver::{KeyResolver, WorkspaceScan};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Initialize the tracing subscriber for test output, once per process.
///
/// Respects `RUST_LOG`; without it test runs stay quiet.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A temporary directory that builds map hierarchies for tests.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        init_test_logging();
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a map file, wrapping `body` in a `<map>` element.
    pub fn write_map(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("<map>\n{body}\n</map>"))?;
        Ok(path)
    }

    /// Write a minimal topic file.
    pub fn write_topic(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, "<topic id=\"t\"><title/></topic>")?;
        Ok(path)
    }

    /// Write arbitrary file content (schemes, malformed input).
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    /// A cache with default settings, plus its provider for live updates.
    pub fn cache(&self) -> (Arc<KeySpaceCache>, Arc<StaticProvider>) {
        self.cache_with(EngineConfig::default())
    }

    pub fn cache_with(&self, config: EngineConfig) -> (Arc<KeySpaceCache>, Arc<StaticProvider>) {
        let provider = Arc::new(StaticProvider::new(config));
        let cache = KeySpaceCache::new(provider.clone()).expect("cache creation");
        (cache, provider)
    }

    /// A resolver scanning this workspace for owning root maps.
    pub fn resolver(&self) -> KeyResolver {
        let (cache, _) = self.cache();
        KeyResolver::new(
            cache,
            Box::new(WorkspaceScan::new(Some(self.path().to_path_buf()))),
        )
    }
}
