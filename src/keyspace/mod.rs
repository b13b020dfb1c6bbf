//! Map hierarchy traversal and key merging.
//!
//! [`KeySpaceBuilder`] walks a map hierarchy depth-first from a root map,
//! runs the reference parser at each level, and folds every key definition
//! encountered into a single ordered symbol table, the [`KeySpace`].
//!
//! # Merge Semantics
//!
//! DITA key precedence is first-wins: the first definition of a key name in
//! full traversal order (root document order, then depth-first into submaps
//! at the point they appear) is retained, and every later definition of the
//! same name is dropped. Dropped definitions are counted and logged, not
//! errored.
//!
//! A `keys` attribute may bind several space-separated names at once; each
//! name merges independently.

use crate::config::EngineConfig;
use crate::core::KeySpaceError;
use crate::parser::{ReferenceKind, ReferenceNode, ReferenceParser};
use crate::utils::fs::read_text_lossy;
use crate::utils::paths::normalize_path;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};

/// What a key definition points at.
///
/// The resolver reports all three classes distinctly; an unresolved key is
/// not an error, it is a key without a usable target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTarget {
    /// A direct reference to an existing file, with an optional fragment.
    File {
        /// Normalized absolute path of the target
        path: PathBuf,
        /// Fragment identifier from the href, if any
        fragment: Option<String>,
    },
    /// Literal element content carried by the key itself (opaque payload).
    Inline(String),
    /// Neither a usable file target nor inline content.
    Unresolved,
}

/// One retained key definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDefinition {
    /// The key name this definition binds
    pub key: String,
    /// Classified target
    pub target: KeyTarget,
    /// Map file the definition was found in
    pub source_map: PathBuf,
}

impl KeyDefinition {
    /// Target file path, when this key resolves to a file.
    #[must_use]
    pub fn target_file(&self) -> Option<&Path> {
        match &self.target {
            KeyTarget::File { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// The merged symbol table for one root map.
///
/// Owned by the cache entry that produced it and treated as read-only by
/// every consumer; a stale key space is rebuilt wholesale, never patched.
#[derive(Debug, Clone)]
pub struct KeySpace {
    /// Root map the space was built from (normalized absolute path)
    pub root_map: PathBuf,
    /// Retained definitions in discovery order
    definitions: Vec<KeyDefinition>,
    /// Key name to index in `definitions`
    index: HashMap<String, usize>,
    /// Every map visited during the build, in traversal order, each once
    pub map_hierarchy: Vec<PathBuf>,
    /// When this space finished building
    pub build_time: SystemTime,
    /// Number of later duplicate definitions dropped by first-wins merging
    pub duplicate_count: usize,
}

impl KeySpace {
    /// Look up a key definition by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KeyDefinition> {
        self.index.get(key).map(|&i| &self.definitions[i])
    }

    /// All retained definitions in discovery order.
    pub fn definitions(&self) -> impl Iterator<Item = &KeyDefinition> {
        self.definitions.iter()
    }

    /// Number of unique keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the space holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Builds a [`KeySpace`] from a root map under a fixed configuration
/// snapshot.
pub struct KeySpaceBuilder {
    config: EngineConfig,
}

impl KeySpaceBuilder {
    /// Create a builder using the given configuration snapshot.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Walk the hierarchy under `root_map` and merge its key definitions.
    ///
    /// # Errors
    ///
    /// [`KeySpaceError::RootMapUnreadable`] when the root map itself cannot
    /// be read, the only fatal case. Missing submaps, cycles, duplicate and
    /// unresolved keys are all folded into the result instead.
    pub async fn build(&self, root_map: &Path) -> Result<KeySpace, KeySpaceError> {
        let root = normalize_root(root_map)?;
        let content = read_text_lossy(&root).await.map_err(|e| {
            KeySpaceError::RootMapUnreadable {
                path: root.clone(),
                reason: e.to_string(),
            }
        })?;

        let parser = ReferenceParser::new(
            self.config.max_reference_matches,
            self.config.workspace_root.clone(),
        )
        .map_err(|e| KeySpaceError::ConfigError {
            message: format!("reference parser init failed: {e}"),
        })?;

        let root_dir = root.parent().unwrap_or(Path::new("/")).to_path_buf();
        let mut visited = HashSet::new();
        visited.insert(root.clone());
        let nodes = parser.parse_references(&content, &root_dir, &mut visited).await;

        let mut space = KeySpace {
            root_map: root.clone(),
            definitions: Vec::new(),
            index: HashMap::new(),
            map_hierarchy: vec![root.clone()],
            build_time: SystemTime::now(),
            duplicate_count: 0,
        };
        fold_nodes(&nodes, &root, &mut space);

        debug!(
            root = %space.root_map.display(),
            keys = space.len(),
            maps = space.map_hierarchy.len(),
            duplicates = space.duplicate_count,
            "key space built"
        );
        Ok(space)
    }
}

/// Depth-first fold of the reference tree into the key table and hierarchy.
///
/// `current_map` is the map the nodes at this level were parsed from; a
/// node's children belong to the submap the node points at.
fn fold_nodes(nodes: &[ReferenceNode], current_map: &Path, space: &mut KeySpace) {
    for node in nodes {
        if node.kind == ReferenceKind::Keydef
            && let Some(keys) = node.keys.as_deref()
        {
            for name in keys.split_whitespace() {
                merge_key(name, node, current_map, space);
            }
        }

        if node.is_submap
            && node.exists
            && !node.is_circular
            && let Some(submap) = node.resolved_path.as_deref()
        {
            space.map_hierarchy.push(submap.to_path_buf());
            fold_nodes(&node.children, submap, space);
        }
    }
}

fn merge_key(name: &str, node: &ReferenceNode, current_map: &Path, space: &mut KeySpace) {
    if space.index.contains_key(name) {
        // First definition wins; later ones are only diagnostics.
        trace!(
            key = name,
            map = %current_map.display(),
            "duplicate key definition dropped"
        );
        space.duplicate_count += 1;
        return;
    }

    let target = classify_target(node);
    space.definitions.push(KeyDefinition {
        key: name.to_string(),
        target,
        source_map: current_map.to_path_buf(),
    });
    space.index.insert(name.to_string(), space.definitions.len() - 1);
}

fn classify_target(node: &ReferenceNode) -> KeyTarget {
    if node.exists
        && let Some(path) = node.resolved_path.as_deref()
    {
        return KeyTarget::File {
            path: path.to_path_buf(),
            fragment: node.fragment.clone(),
        };
    }
    if node.href.is_none()
        && let Some(text) = node.inline_content.as_deref()
    {
        return KeyTarget::Inline(text.to_string());
    }
    KeyTarget::Unresolved
}

/// Make the root path absolute and fold out `.`/`..` so the visited set and
/// cache keys are stable regardless of how callers spell the path.
fn normalize_root(path: &Path) -> Result<PathBuf, KeySpaceError> {
    let absolute = std::path::absolute(path)?;
    Ok(normalize_path(&absolute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn builder() -> KeySpaceBuilder {
        KeySpaceBuilder::new(EngineConfig::default())
    }

    fn write_map(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, format!("<map>{body}</map>")).unwrap();
        path
    }

    #[tokio::test]
    async fn test_build_simple_key_space() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("t1.dita"), "<topic/>").unwrap();
        fs::write(dir.path().join("t2.dita"), "<topic/>").unwrap();
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="a" href="t1.dita"/><keydef keys="b" href="t2.dita"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        assert_eq!(space.len(), 2);
        assert_eq!(
            space.get("a").unwrap().target_file(),
            Some(dir.path().join("t1.dita").as_path())
        );
        assert_eq!(
            space.get("b").unwrap().target_file(),
            Some(dir.path().join("t2.dita").as_path())
        );
    }

    #[tokio::test]
    async fn test_first_definition_wins() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("first.dita"), "<topic/>").unwrap();
        fs::write(dir.path().join("second.dita"), "<topic/>").unwrap();
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="product" href="first.dita"/>
               <keydef keys="product" href="second.dita"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        assert_eq!(space.len(), 1);
        assert_eq!(
            space.get("product").unwrap().target_file(),
            Some(dir.path().join("first.dita").as_path())
        );
        assert_eq!(space.duplicate_count, 1);
    }

    #[tokio::test]
    async fn test_root_definition_beats_submap() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("root-target.dita"), "<topic/>").unwrap();
        fs::write(dir.path().join("sub-target.dita"), "<topic/>").unwrap();
        write_map(
            &dir,
            "sub.ditamap",
            r#"<keydef keys="shared" href="sub-target.dita"/>
               <keydef keys="sub-only" href="sub-target.dita"/>"#,
        );
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="shared" href="root-target.dita"/>
               <mapref href="sub.ditamap"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        let shared = space.get("shared").unwrap();
        assert_eq!(shared.source_map, root);
        assert_eq!(
            shared.target_file(),
            Some(dir.path().join("root-target.dita").as_path())
        );
        // The submap's own key still lands, attributed to the submap
        let sub_only = space.get("sub-only").unwrap();
        assert_eq!(sub_only.source_map, dir.path().join("sub.ditamap"));
    }

    #[tokio::test]
    async fn test_submap_definition_wins_when_earlier_in_document_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sub-target.dita"), "<topic/>").unwrap();
        fs::write(dir.path().join("late.dita"), "<topic/>").unwrap();
        write_map(&dir, "sub.ditamap", r#"<keydef keys="k" href="sub-target.dita"/>"#);
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<mapref href="sub.ditamap"/>
               <keydef keys="k" href="late.dita"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        // The submap is entered at its position in document order, so its
        // definition precedes the root's later one.
        assert_eq!(space.get("k").unwrap().source_map, dir.path().join("sub.ditamap"));
    }

    #[tokio::test]
    async fn test_map_hierarchy_unique_and_ordered() {
        let dir = tempdir().unwrap();
        write_map(&dir, "shared.ditamap", r#"<keydef keys="x" href="gone.dita"/>"#);
        write_map(&dir, "a.ditamap", r#"<mapref href="shared.ditamap"/>"#);
        write_map(&dir, "b.ditamap", r#"<mapref href="shared.ditamap"/>"#);
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<mapref href="a.ditamap"/><mapref href="b.ditamap"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        assert_eq!(
            space.map_hierarchy,
            vec![
                root.clone(),
                dir.path().join("a.ditamap"),
                dir.path().join("shared.ditamap"),
                dir.path().join("b.ditamap"),
            ]
        );
    }

    #[tokio::test]
    async fn test_self_referencing_map_terminates() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("self.ditamap");
        fs::write(
            &root,
            r#"<map><mapref href="self.ditamap"/><keydef keys="k" href="t.dita"/></map>"#,
        )
        .unwrap();

        let space = builder().build(&root).await.unwrap();
        assert_eq!(space.map_hierarchy, vec![root]);
        assert!(space.get("k").is_some());
    }

    #[tokio::test]
    async fn test_source_map_always_in_hierarchy() {
        let dir = tempdir().unwrap();
        write_map(
            &dir,
            "sub.ditamap",
            r#"<keydef keys="deep" href="missing.dita"/>"#,
        );
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="top" href="also-missing.dita"/><mapref href="sub.ditamap"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        for def in space.definitions() {
            assert!(
                space.map_hierarchy.contains(&def.source_map),
                "source map {} missing from hierarchy",
                def.source_map.display()
            );
        }
    }

    #[tokio::test]
    async fn test_target_classification() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.dita"), "<topic/>").unwrap();
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="file-key" href="real.dita"/>
               <keydef keys="inline-key"><topicmeta><keyword>Literal</keyword></topicmeta></keydef>
               <keydef keys="broken-key" href="missing.dita"/>
               <keydef keys="bare-key"/>"#,
        );

        let space = builder().build(&root).await.unwrap();
        assert!(matches!(space.get("file-key").unwrap().target, KeyTarget::File { .. }));
        assert_eq!(
            space.get("inline-key").unwrap().target,
            KeyTarget::Inline("Literal".to_string())
        );
        assert_eq!(space.get("broken-key").unwrap().target, KeyTarget::Unresolved);
        assert_eq!(space.get("bare-key").unwrap().target, KeyTarget::Unresolved);
    }

    #[tokio::test]
    async fn test_multi_name_keys_attribute() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("t.dita"), "<topic/>").unwrap();
        let root = write_map(&dir, "root.ditamap", r#"<keydef keys="alpha beta" href="t.dita"/>"#);

        let space = builder().build(&root).await.unwrap();
        assert_eq!(space.len(), 2);
        assert_eq!(space.get("alpha").unwrap().target, space.get("beta").unwrap().target);
    }

    #[tokio::test]
    async fn test_unreadable_root_is_fatal() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.ditamap");
        let err = builder().build(&missing).await.unwrap_err();
        assert!(matches!(err, KeySpaceError::RootMapUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_huge_map_is_bounded_by_ceiling() {
        let dir = tempdir().unwrap();
        let mut body = String::new();
        for i in 0..15_000 {
            body.push_str(&format!("<keydef keys=\"k{i}\" href=\"t{i}.dita\"/>\n"));
        }
        let root = write_map(&dir, "huge.ditamap", &body);

        let mut config = EngineConfig::default();
        config.max_reference_matches = 10_000;
        let space = KeySpaceBuilder::new(config).build(&root).await.unwrap();
        assert_eq!(space.len(), 10_000);
    }

    #[tokio::test]
    async fn test_binary_root_content_is_tolerated() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("weird.ditamap");
        fs::write(&root, b"\x00\xff\xfe<map><keydef keys=\"k\"/></map>\x00").unwrap();
        let space = builder().build(&root).await.unwrap();
        assert!(space.get("k").is_some());
    }
}
