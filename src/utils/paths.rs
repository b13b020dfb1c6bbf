//! Path normalization and boundary checks for href resolution.
//!
//! Hrefs from untrusted map content are resolved relative to their map's
//! directory and then lexically normalized so that no stored path carries
//! residual `..` segments. When the engine is given a workspace boundary,
//! any resolution that would escape it is rejected by the caller (the key is
//! kept, its target is not).

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path, folding `.` and `..` components.
///
/// Purely textual: no filesystem access, no symlink resolution. A `..` at
/// the very top of a relative path is preserved (there is nothing to fold it
/// into); for absolute paths it folds into the root.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Resolve an `href` value against the directory of the referencing map.
///
/// Strips any `#fragment` suffix before resolving and returns the normalized
/// absolute path together with the fragment (if one was present). Returns
/// `None` for empty hrefs and for external references (URLs).
#[must_use]
pub fn resolve_href(href: &str, base_dir: &Path) -> Option<(PathBuf, Option<String>)> {
    let trimmed = href.trim();
    if trimmed.is_empty() || trimmed.contains("://") || trimmed.starts_with("mailto:") {
        return None;
    }

    let (path_part, fragment) = match trimmed.split_once('#') {
        Some((p, f)) if !f.is_empty() => (p, Some(f.to_string())),
        Some((p, _)) => (p, None),
        None => (trimmed, None),
    };
    if path_part.is_empty() {
        // Fragment-only href points into the current document
        return None;
    }

    let raw = Path::new(path_part);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base_dir.join(raw)
    };
    Some((normalize_path(&joined), fragment))
}

/// Make a path absolute and lexically normalized.
///
/// Used for root map paths so visited sets and cache keys are stable no
/// matter how callers spell the path. No symlink resolution.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    Ok(normalize_path(&std::path::absolute(path)?))
}

/// Check that a normalized path stays inside a boundary directory.
#[must_use]
pub fn within_boundary(path: &Path, boundary: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(boundary))
}

/// Whether a path looks like a DITA map document by extension.
#[must_use]
pub fn is_map_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ditamap") | Some("bookmap")
    )
}
