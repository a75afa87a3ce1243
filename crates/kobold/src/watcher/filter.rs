use std::path::Path;

/// Extensions the pipeline accepts, lowercase.
pub const TRACKED_EXTENSIONS: &[&str] = &["epub", "kepub", "pdf"];

/// Suffix of converter output, which is a product of the pipeline and never
/// an input.
pub const CONVERTED_SUFFIX: &str = ".kepub.epub";

/// Whether a path names a file the pipeline should track. Judged on the name
/// alone so it also works for paths that no longer exist.
pub fn is_tracked(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with("~$") {
        return false;
    }

    let lower = name.to_ascii_lowercase();
    if lower.ends_with(CONVERTED_SUFFIX) {
        return false;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TRACKED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
