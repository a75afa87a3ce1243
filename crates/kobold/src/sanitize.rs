//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Library paths reveal user names and reading habits; spans carry only the
//! file name.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}
