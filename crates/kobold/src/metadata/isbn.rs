use std::sync::LazyLock;

use regex::Regex;

static RE_ISBN_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:97[89][- ]?)?\d(?:[- ]?\d){8}[- ]?[\dX]\b").unwrap());

/// Normalizes an ISBN-10 or ISBN-13 string: drops a `urn:isbn:` prefix,
/// hyphens and spaces. Returns `None` if what remains is not 13 digits or
/// 9 digits followed by a digit or `X`.
pub fn parse_isbn(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = strip_prefix_ci(trimmed, "urn:isbn:")
        .or_else(|| strip_prefix_ci(trimmed, "isbn:"))
        .or_else(|| strip_prefix_ci(trimmed, "isbn"))
        .unwrap_or(trimmed);

    let compact: String = body
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let valid = match compact.len() {
        13 => compact.chars().all(|c| c.is_ascii_digit()),
        10 => {
            let (head, check) = compact.split_at(9);
            head.chars().all(|c| c.is_ascii_digit())
                && check.chars().all(|c| c.is_ascii_digit() || c == 'X')
        }
        _ => false,
    };
    valid.then_some(compact)
}

/// First ISBN-looking token in free text, e.g. a PDF `Keywords` entry.
pub fn find_isbn(text: &str) -> Option<String> {
    RE_ISBN_CANDIDATE
        .find_iter(text)
        .find_map(|m| parse_isbn(m.as_str()))
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
