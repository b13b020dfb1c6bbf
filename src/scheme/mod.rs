//! Subject scheme overlay: controlled attribute values from scheme maps.
//!
//! A DITA subject scheme map declares named subject hierarchies
//! (`<subjectdef>`) and binds them to attributes (`<enumerationdef>`): the
//! bound attribute, optionally scoped to one element (else the wildcard
//! `*`), may only take the values in the referenced subject's flattened
//! descendant set, with an optional `<defaultsubject>`.
//!
//! [`SubjectSchemeRegistry`] parses registered scheme files, caches each
//! parse by path with a TTL, and merges all registered schemes into one
//! memoized overlay: valid values union across schemes,
//! first-registered-wins for defaults. The memo is invalidated whenever the
//! registered set changes or a scheme file is explicitly invalidated.

use crate::utils::fs::read_text_lossy;
use crate::utils::paths::absolutize;
use dashmap::DashMap;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wildcard element scope: the binding applies to the attribute everywhere.
pub const ANY_ELEMENT: &str = "*";

/// Controlled-value data from one scheme file, or the merge of several.
#[derive(Debug, Clone, Default)]
pub struct SubjectSchemeData {
    /// attribute → element (or `*`) → allowed values
    valid_values: HashMap<String, HashMap<String, BTreeSet<String>>>,
    /// attribute → element (or `*`) → default value
    defaults: HashMap<String, HashMap<String, String>>,
}

impl SubjectSchemeData {
    /// Allowed values for an attribute, preferring an element-specific
    /// binding over the wildcard one.
    #[must_use]
    pub fn valid_values(&self, attribute: &str, element: Option<&str>) -> Option<&BTreeSet<String>> {
        let by_element = self.valid_values.get(attribute)?;
        if let Some(element) = element
            && let Some(values) = by_element.get(element)
        {
            return Some(values);
        }
        by_element.get(ANY_ELEMENT)
    }

    /// Default value for an attribute, preferring an element-specific
    /// binding.
    #[must_use]
    pub fn default_value(&self, attribute: &str, element: Option<&str>) -> Option<&str> {
        let by_element = self.defaults.get(attribute)?;
        if let Some(element) = element
            && let Some(value) = by_element.get(element)
        {
            return Some(value);
        }
        by_element.get(ANY_ELEMENT).map(String::as_str)
    }

    /// Whether any binding controls this attribute.
    #[must_use]
    pub fn is_controlled(&self, attribute: &str) -> bool {
        self.valid_values.contains_key(attribute)
    }

    /// Fold `other` into `self`: union of valid values, existing defaults
    /// kept (first-wins).
    fn merge_from(&mut self, other: &Self) {
        for (attribute, by_element) in &other.valid_values {
            let target = self.valid_values.entry(attribute.clone()).or_default();
            for (element, values) in by_element {
                target
                    .entry(element.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
        for (attribute, by_element) in &other.defaults {
            let target = self.defaults.entry(attribute.clone()).or_default();
            for (element, value) in by_element {
                target.entry(element.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

/// Parse one scheme document's text into overlay data.
///
/// Anomalies (dangling keyrefs, missing attributedefs) are logged and
/// skipped; a malformed scheme never fails the registry.
fn parse_scheme(content: &str) -> SubjectSchemeData {
    let mut data = SubjectSchemeData::default();
    let groups = collect_subject_groups(content);

    let Ok(enum_block) = Regex::new(r"(?s)<enumerationdef\b[^>]*>(.*?)</enumerationdef>") else {
        return data;
    };
    let attr_name = Regex::new(r#"<attributedef\b[^>]*?name\s*=\s*["']([^"']+)["']"#).ok();
    let elem_name = Regex::new(r#"<elementdef\b[^>]*?name\s*=\s*["']([^"']+)["']"#).ok();
    let subject_ref = Regex::new(r#"<subjectdef\b[^>]*?keyref\s*=\s*["']([^"']+)["']"#).ok();
    let default_ref = Regex::new(r#"<defaultsubject\b[^>]*?keyref\s*=\s*["']([^"']+)["']"#).ok();
    let (Some(attr_name), Some(elem_name), Some(subject_ref), Some(default_ref)) =
        (attr_name, elem_name, subject_ref, default_ref)
    else {
        return data;
    };

    for block in enum_block.captures_iter(content) {
        let body = block.get(1).map(|m| m.as_str()).unwrap_or_default();
        let Some(attribute) = attr_name.captures(body).and_then(|c| c.get(1)) else {
            warn!("enumerationdef without attributedef skipped");
            continue;
        };
        let attribute = attribute.as_str().to_string();
        let element = elem_name
            .captures(body)
            .and_then(|c| c.get(1))
            .map_or(ANY_ELEMENT, |m| m.as_str())
            .to_string();

        let mut values = BTreeSet::new();
        for group_ref in subject_ref.captures_iter(body) {
            let key = group_ref.get(1).map(|m| m.as_str()).unwrap_or_default();
            match groups.get(key) {
                Some(members) => values.extend(members.iter().cloned()),
                None => warn!(keyref = key, "enumerationdef references unknown subject"),
            }
        }
        data.valid_values
            .entry(attribute.clone())
            .or_default()
            .entry(element.clone())
            .or_default()
            .extend(values);

        if let Some(default) = default_ref.captures(body).and_then(|c| c.get(1)) {
            data.defaults
                .entry(attribute)
                .or_default()
                .insert(element, default.as_str().to_string());
        }
    }
    data
}

/// Scan `<subjectdef>` start/end tags with a depth stack and return each
/// subject key mapped to its recursively flattened descendant key set.
///
/// Depth tracking is what makes nested close tags match the right open tag;
/// a descendant's key is added to the member set of every open ancestor, so
/// flattening falls out of the walk itself.
fn collect_subject_groups(content: &str) -> HashMap<String, BTreeSet<String>> {
    let Ok(tag) = Regex::new(r"<subjectdef\b([^>]*?)(/?)>|</subjectdef>") else {
        return HashMap::new();
    };
    let keys_attr = Regex::new(r#"keys\s*=\s*["']([^"']+)["']"#).ok();

    let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
    // Keys of currently open subjectdefs, innermost last; None for keyless
    // or keyref-only entries (they still occupy a depth slot).
    let mut stack: Vec<Option<String>> = Vec::new();

    for caps in tag.captures_iter(content) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.starts_with("</") {
            stack.pop();
            continue;
        }

        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let self_closing = caps.get(2).is_some_and(|m| m.as_str() == "/");
        let key = keys_attr
            .as_ref()
            .and_then(|re| re.captures(attrs))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().next().unwrap_or("").to_string())
            .filter(|k| !k.is_empty());

        if let Some(key) = &key {
            groups.entry(key.clone()).or_default();
            for ancestor in stack.iter().flatten() {
                groups.entry(ancestor.clone()).or_default().insert(key.clone());
            }
        }
        if !self_closing {
            stack.push(key);
        }
    }
    groups
}

struct SchemeEntry {
    data: Arc<SubjectSchemeData>,
    loaded_at: Instant,
}

/// Registry of subject scheme files for a workspace.
///
/// Per-scheme parses are cached by path with a TTL; the cross-scheme merge
/// is memoized until the registered set changes or a file is invalidated.
pub struct SubjectSchemeRegistry {
    ttl: Duration,
    registered: RwLock<Vec<PathBuf>>,
    per_file: DashMap<PathBuf, SchemeEntry>,
    merged: RwLock<Option<Arc<SubjectSchemeData>>>,
}

impl SubjectSchemeRegistry {
    /// Create a registry whose per-file parses are reused for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            registered: RwLock::new(Vec::new()),
            per_file: DashMap::new(),
            merged: RwLock::new(None),
        }
    }

    /// Replace the registered scheme set (order matters for defaults) and
    /// invalidate the merged overlay.
    pub fn register_schemes(&self, paths: Vec<PathBuf>) {
        let normalized: Vec<PathBuf> = paths
            .into_iter()
            .filter_map(|p| absolutize(&p).ok())
            .collect();
        debug!(count = normalized.len(), "subject schemes registered");
        *self.registered.write().unwrap_or_else(|e| e.into_inner()) = normalized;
        self.merged.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Allowed values for an attribute across all registered schemes.
    ///
    /// `None` means the attribute is not controlled at all; an empty set
    /// means controlled but (currently) valueless.
    pub async fn get_valid_values(
        &self,
        attribute: &str,
        element: Option<&str>,
    ) -> Option<BTreeSet<String>> {
        self.merged()
            .await
            .valid_values(attribute, element)
            .cloned()
    }

    /// Default value for an attribute, first-registered scheme wins.
    pub async fn get_default_value(&self, attribute: &str, element: Option<&str>) -> Option<String> {
        self.merged()
            .await
            .default_value(attribute, element)
            .map(str::to_string)
    }

    /// Whether any registered scheme controls this attribute.
    pub async fn is_controlled_attribute(&self, attribute: &str) -> bool {
        self.merged().await.is_controlled(attribute)
    }

    /// Drop the cached parse for one scheme file and the merged overlay.
    pub fn invalidate(&self, path: &Path) {
        if let Ok(path) = absolutize(path) {
            self.per_file.remove(&path);
        }
        self.merged.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn merged(&self) -> Arc<SubjectSchemeData> {
        if let Some(merged) = self
            .merged
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return merged;
        }

        let registered = self
            .registered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut combined = SubjectSchemeData::default();
        for path in &registered {
            let data = self.load_scheme(path).await;
            combined.merge_from(&data);
        }

        let combined = Arc::new(combined);
        *self.merged.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&combined));
        combined
    }

    async fn load_scheme(&self, path: &Path) -> Arc<SubjectSchemeData> {
        if let Some(entry) = self.per_file.get(path)
            && entry.loaded_at.elapsed() < self.ttl
        {
            return Arc::clone(&entry.data);
        }

        let data = match read_text_lossy(path).await {
            Ok(content) => Arc::new(parse_scheme(&content)),
            Err(err) => {
                warn!(path = %path.display(), %err, "subject scheme unreadable, treated as empty");
                Arc::new(SubjectSchemeData::default())
            }
        };
        self.per_file.insert(
            path.to_path_buf(),
            SchemeEntry {
                data: Arc::clone(&data),
                loaded_at: Instant::now(),
            },
        );
        data
    }
}
