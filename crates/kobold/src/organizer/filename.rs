use std::path::Path;

use crate::watcher::filter::CONVERTED_SUFFIX;

/// Longest rendered path segment, in bytes. Leaves room under the usual
/// 255-byte name limit for collision suffixes, the converted extension and
/// the hidden sibling names used while writing.
pub const MAX_SEGMENT_BYTES: usize = 200;

const TRIMMED: &[char] = &['.', ' ', '\t', '\n', '\r'];

fn is_illegal(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Makes one directory or file name segment safe on every common
/// filesystem. May return an empty string.
pub fn sanitize_segment(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if is_illegal(c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(TRIMMED);
    truncate_bytes(trimmed, MAX_SEGMENT_BYTES)
        .trim_end_matches(TRIMMED)
        .to_string()
}

/// Sanitized `stem` plus `extension` (which includes its leading dot),
/// with the stem shortened so the whole name fits in a segment.
pub fn file_name(stem: &str, extension: &str) -> String {
    let budget = MAX_SEGMENT_BYTES.saturating_sub(extension.len());
    let stem = sanitize_segment(stem);
    let stem = truncate_bytes(&stem, budget).trim_end_matches(TRIMMED);
    format!("{}{}", stem, extension)
}

/// The extension of an e-book file including the dot, keeping the compound
/// `.kepub.epub` together.
pub fn book_extension(path: &Path) -> String {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return String::new();
    };
    if name.to_ascii_lowercase().ends_with(CONVERTED_SUFFIX) {
        return name[name.len() - CONVERTED_SUFFIX.len()..].to_string();
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
