//! Reference extraction from DITA map documents.
//!
//! This module scans map content for the reference elements the key space
//! engine cares about (`topicref`, `chapter`, `appendix`, `part`, `keydef`,
//! `mapref`) and produces an ordered tree of [`ReferenceNode`]s. Order is
//! load-bearing: key precedence downstream is first-wins in document order,
//! so the scan uses a single combined pattern that preserves it.
//!
//! # Extraction Rules
//!
//! - XML comments are stripped before scanning; commented-out references are
//!   never extracted.
//! - `href` values are resolved against the referencing map's directory and
//!   lexically normalized; existence is probed and recorded on the node.
//! - A resolved submap (`.ditamap`/`.bookmap`, or any `mapref`) that has not
//!   been visited yet is recursed into and its references attached as
//!   children. An already-visited submap becomes a single node flagged
//!   circular, with a "(circular ref)" label; cycles are neutralized, not
//!   followed.
//! - A missing or unreadable submap yields a node with `exists = false` and
//!   no children; only the root document's readability is the caller's
//!   problem.
//! - Scanning stops at a configurable match ceiling to bound work against
//!   pathological inputs; the partial result is returned.

use crate::utils::fs::{probe_exists, read_text_lossy};
use crate::utils::paths::{is_map_file, resolve_href, within_boundary};
use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The kinds of reference element the parser recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `<topicref>`: generic topic reference
    Topicref,
    /// `<chapter>`: bookmap chapter reference
    Chapter,
    /// `<appendix>`: bookmap appendix reference
    Appendix,
    /// `<part>`: bookmap part reference
    Part,
    /// `<keydef>`: key definition
    Keydef,
    /// `<mapref>`: submap reference
    Mapref,
}

impl ReferenceKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "topicref" => Some(Self::Topicref),
            "chapter" => Some(Self::Chapter),
            "appendix" => Some(Self::Appendix),
            "part" => Some(Self::Part),
            "keydef" => Some(Self::Keydef),
            "mapref" => Some(Self::Mapref),
            _ => None,
        }
    }

    /// Element name as it appears in markup.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topicref => "topicref",
            Self::Chapter => "chapter",
            Self::Appendix => "appendix",
            Self::Part => "part",
            Self::Keydef => "keydef",
            Self::Mapref => "mapref",
        }
    }
}

/// One extracted reference, with resolution results and children for submaps.
///
/// Immutable once produced; the key space builder folds keydef nodes into its
/// symbol table and tree consumers read labels and flags.
#[derive(Debug, Clone)]
pub struct ReferenceNode {
    /// Which element produced this node
    pub kind: ReferenceKind,
    /// Raw `href` attribute value, if present
    pub href: Option<String>,
    /// Raw `keys` attribute value (may hold several space-separated names)
    pub keys: Option<String>,
    /// Raw `keyref` attribute value, if present
    pub keyref: Option<String>,
    /// Raw `navtitle` attribute value, if present
    pub navtitle: Option<String>,
    /// Normalized absolute target path, when `href` resolved to a local file
    pub resolved_path: Option<PathBuf>,
    /// Fragment identifier carried by the `href`, if any
    pub fragment: Option<String>,
    /// Inline element text for keydefs without an href (opaque payload)
    pub inline_content: Option<String>,
    /// Whether the resolved target exists on disk
    pub exists: bool,
    /// Set when the resolved target is a submap (by extension, or any mapref)
    pub is_submap: bool,
    /// Set when this reference closes a cycle in the map hierarchy
    pub is_circular: bool,
    /// Set when href resolution escaped the workspace boundary
    pub out_of_bounds: bool,
    /// Display label (navtitle → keys → keyref → href basename → "Unknown")
    pub label: String,
    /// References extracted from the submap this node points at
    pub children: Vec<ReferenceNode>,
}

/// Combined scanner over the recognized reference elements.
///
/// Holds its compiled patterns and the per-document match ceiling; one
/// instance is reused for a whole hierarchy traversal.
pub struct ReferenceParser {
    max_matches: usize,
    workspace_root: Option<PathBuf>,
    element: Regex,
    comment: Regex,
    tag_strip: Regex,
    attr_href: Regex,
    attr_keys: Regex,
    attr_keyref: Regex,
    attr_navtitle: Regex,
}

impl ReferenceParser {
    /// Create a parser with the given match ceiling and optional workspace
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile (a bug, not an input
    /// condition).
    pub fn new(max_matches: usize, workspace_root: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            max_matches,
            workspace_root,
            element: Regex::new(r"<(topicref|chapter|appendix|part|keydef|mapref)\b([^>]*?)(/?)>")?,
            comment: Regex::new(r"(?s)<!--.*?-->")?,
            tag_strip: Regex::new(r"<[^>]*>")?,
            attr_href: Regex::new(r#"href\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            attr_keys: Regex::new(r#"keys\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            attr_keyref: Regex::new(r#"keyref\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            attr_navtitle: Regex::new(r#"navtitle\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    /// Extract the ordered reference tree from one map document.
    ///
    /// `visited` is the shared traversal set; it must already contain the
    /// document being parsed so self-references are flagged circular.
    /// Submaps reached through hrefs are parsed recursively, sharing the
    /// same set.
    pub async fn parse_references(
        &self,
        content: &str,
        base_dir: &Path,
        visited: &mut HashSet<PathBuf>,
    ) -> Vec<ReferenceNode> {
        let stripped = self.comment.replace_all(content, "");
        let stripped: &str = stripped.as_ref();
        let mut nodes = Vec::new();

        // Collect matches up front: captures_iter borrows `stripped`, and the
        // recursion below needs `self` free for the next await point.
        let mut matches = Vec::new();
        for (index, caps) in self.element.captures_iter(&stripped).enumerate() {
            if index >= self.max_matches {
                warn!(
                    limit = self.max_matches,
                    "reference match ceiling reached, truncating scan"
                );
                break;
            }
            let tag = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let attrs = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            let self_closing = caps.get(3).is_some_and(|m| m.as_str() == "/");
            let end = caps.get(0).map_or(0, |m| m.end());
            matches.push((tag, attrs, self_closing, end));
        }

        for (tag, attrs, self_closing, end) in matches {
            let Some(kind) = ReferenceKind::from_tag(&tag) else {
                continue;
            };
            let node = self
                .build_node(kind, &attrs, self_closing, &stripped[end..], base_dir, visited)
                .await;
            nodes.push(node);
        }

        nodes
    }

    async fn build_node(
        &self,
        kind: ReferenceKind,
        attrs: &str,
        self_closing: bool,
        rest: &str,
        base_dir: &Path,
        visited: &mut HashSet<PathBuf>,
    ) -> ReferenceNode {
        let href = attr_value(&self.attr_href, attrs);
        let keys = attr_value(&self.attr_keys, attrs);
        let keyref = attr_value(&self.attr_keyref, attrs);
        let navtitle = attr_value(&self.attr_navtitle, attrs);

        let mut node = ReferenceNode {
            kind,
            href: href.clone(),
            keys,
            keyref,
            navtitle,
            resolved_path: None,
            fragment: None,
            inline_content: None,
            exists: false,
            is_submap: false,
            is_circular: false,
            out_of_bounds: false,
            label: String::new(),
            children: Vec::new(),
        };

        if kind == ReferenceKind::Keydef && !self_closing {
            node.inline_content = self.extract_inline_content(rest);
        }

        if let Some(href) = href.as_deref()
            && let Some((resolved, fragment)) = resolve_href(href, base_dir)
        {
            if let Some(boundary) = self.workspace_root.as_deref()
                && !within_boundary(&resolved, boundary)
            {
                debug!(
                    path = %resolved.display(),
                    boundary = %boundary.display(),
                    "href resolution escapes workspace boundary, target dropped"
                );
                node.out_of_bounds = true;
            } else {
                node.exists = probe_exists(&resolved).await;
                node.fragment = fragment;
                let is_submap = kind == ReferenceKind::Mapref || is_map_file(&resolved);
                node.is_submap = is_submap;

                if is_submap && visited.contains(&resolved) {
                    node.is_circular = true;
                } else if is_submap && node.exists {
                    visited.insert(resolved.clone());
                    match read_text_lossy(&resolved).await {
                        Ok(submap_content) => {
                            let submap_dir =
                                resolved.parent().unwrap_or(base_dir).to_path_buf();
                            node.children = Box::pin(self.parse_references(
                                &submap_content,
                                &submap_dir,
                                visited,
                            ))
                            .await;
                        }
                        Err(err) => {
                            debug!(path = %resolved.display(), %err, "submap unreadable");
                            node.exists = false;
                        }
                    }
                }
                node.resolved_path = Some(resolved);
            }
        }

        node.label = self.node_label(&node);
        if node.is_circular {
            node.label = format!("{} (circular ref)", node.label);
        }
        node
    }

    /// Inner text of a keydef element, tags stripped, or `None` when empty.
    fn extract_inline_content(&self, rest: &str) -> Option<String> {
        let inner = &rest[..rest.find("</keydef>")?];
        let text = self.tag_strip.replace_all(inner, " ");
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn node_label(&self, node: &ReferenceNode) -> String {
        if let Some(title) = node.navtitle.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.trim().to_string();
        }
        if let Some(keys) = node.keys.as_deref().filter(|k| !k.trim().is_empty()) {
            return keys.trim().to_string();
        }
        if let Some(keyref) = node.keyref.as_deref().filter(|k| !k.trim().is_empty()) {
            return keyref.trim().to_string();
        }
        if let Some(href) = node.href.as_deref() {
            let name = href.split('#').next().unwrap_or(href);
            if let Some(base) = Path::new(name).file_name().and_then(|n| n.to_str())
                && !base.is_empty()
            {
                return base.to_string();
            }
        }
        "Unknown".to_string()
    }
}

/// First captured group of an attribute pattern (double or single quoted).
fn attr_value(pattern: &Regex, attrs: &str) -> Option<String> {
    pattern.captures(attrs).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
    })
}
