//! Tolerant asynchronous file reading.
//!
//! Map hierarchies routinely point at files that are missing, empty, binary,
//! or very large. The engine must treat all of those as valid-but-empty(ish)
//! input rather than failing a whole build, so reads here decode lossily and
//! never panic on malformed bytes.

use std::path::Path;
use tokio::fs;

/// Read a file as text, tolerating non-UTF8 bytes and embedded NULs.
///
/// Invalid UTF-8 sequences are replaced with U+FFFD; NUL bytes are stripped
/// so downstream regex scans see a clean string. An empty file yields an
/// empty string.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be read at all
/// (missing, is a directory, permission denied). Callers decide whether that
/// is fatal (root map) or a non-existent node (submap).
pub async fn read_text_lossy(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path).await?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.contains('\0') {
        text.retain(|c| c != '\0');
    }
    Ok(text)
}

/// Probe whether a path exists without blocking the caller.
///
/// Any probe failure (permission denied, dangling symlink) is reported as
/// non-existent; existence here is advisory, not authoritative.
pub async fn probe_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_text_lossy_utf8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.ditamap");
        std_fs::write(&path, "<map></map>").unwrap();
        assert_eq!(read_text_lossy(&path).await.unwrap(), "<map></map>");
    }

    #[tokio::test]
    async fn test_read_text_lossy_invalid_utf8_and_nuls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("binary.ditamap");
        std_fs::write(&path, b"<map>\xff\xfe\0\0</map>").unwrap();
        let text = read_text_lossy(&path).await.unwrap();
        assert!(!text.contains('\0'));
        assert!(text.starts_with("<map>"));
        assert!(text.ends_with("</map>"));
    }

    #[tokio::test]
    async fn test_read_text_lossy_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.ditamap");
        std_fs::write(&path, "").unwrap();
        assert_eq!(read_text_lossy(&path).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_read_text_lossy_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.ditamap");
        assert!(read_text_lossy(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("topic.dita");
        assert!(!probe_exists(&path).await);
        std_fs::write(&path, "x").unwrap();
        assert!(probe_exists(&path).await);
    }
}
