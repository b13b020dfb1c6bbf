//! Cross-cutting utilities: tolerant file reading and safe path handling.

pub mod fs;
pub mod paths;

pub use fs::read_text_lossy;
pub use paths::{absolutize, is_map_file, normalize_path, resolve_href, within_boundary};
