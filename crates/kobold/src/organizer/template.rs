//! Destination path templates such as `{author}/{series}/{series_index} - {title}`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::filename::{book_extension, file_name, sanitize_segment};
use crate::error::TemplateError;
use crate::metadata::{file_stem, BookMetadata};

/// Characters trimmed from a segment's ends after a missing field was
/// collapsed out of it.
const DANGLING: &[char] = &[' ', '\t', '-', '_', ',', '.', ':', ';'];

const BRACKETS: &[(char, char)] = &[('(', ')'), ('[', ']')];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Author,
    Title,
    Series,
    SeriesIndex,
    Language,
    Genre,
    Year,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Author,
        Field::Title,
        Field::Series,
        Field::SeriesIndex,
        Field::Language,
        Field::Genre,
        Field::Year,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Title => "title",
            Self::Series => "series",
            Self::SeriesIndex => "series_index",
            Self::Language => "language",
            Self::Genre => "genre",
            Self::Year => "year",
        }
    }

    fn value(self, meta: &BookMetadata) -> Option<String> {
        let raw = match self {
            Self::Author => meta.author.clone(),
            Self::Title => meta.title.clone(),
            Self::Series => meta.series.clone(),
            Self::SeriesIndex => meta.series_index.map(format_series_index),
            Self::Language => meta.language.clone(),
            Self::Genre => meta.genre.clone(),
            Self::Year => meta.year.map(|y| y.to_string()),
        }?;
        Some(sanitize_segment(&raw)).filter(|v| !v.is_empty())
    }
}

impl FromStr for Field {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| TemplateError::UnknownPlaceholder(s.to_string()))
    }
}

/// `2` → `02`, `2.5` → `02.5`.
fn format_series_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{:02}", index as i64)
    } else {
        format!("{:04.1}", index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    tokens: Vec<Token>,
}

impl Segment {
    fn has_fields(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Field(_)))
    }

    /// Substitutes values. A missing field takes its separator with it;
    /// a segment whose fields are all missing disappears.
    fn render(&self, meta: &BookMetadata) -> Option<String> {
        if !self.has_fields() {
            let text: String = self
                .tokens
                .iter()
                .map(|t| match t {
                    Token::Literal(s) => s.as_str(),
                    Token::Field(_) => "",
                })
                .collect();
            return Some(sanitize_segment(&text)).filter(|s| !s.is_empty());
        }

        // None = missing field or dropped literal
        let mut parts: Vec<Option<String>> = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Literal(s) => Some(s.clone()),
                Token::Field(f) => f.value(meta),
            })
            .collect();

        let missing: Vec<usize> = self
            .tokens
            .iter()
            .enumerate()
            .filter(|(i, t)| matches!(t, Token::Field(_)) && parts[*i].is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.len() == self.tokens.iter().filter(|t| matches!(t, Token::Field(_))).count() {
            return None;
        }

        for &i in &missing {
            let is_literal = |j: usize| matches!(self.tokens.get(j), Some(Token::Literal(_)));
            let is_field = |j: usize| matches!(self.tokens.get(j), Some(Token::Field(_)));
            let prev = i.checked_sub(1).filter(|&j| is_literal(j));
            let next = Some(i + 1).filter(|&j| is_literal(j));

            if let (Some(p), Some(n)) = (prev, next) {
                if strip_brackets(&mut parts, p, n) {
                    continue;
                }
            }
            match (prev, next) {
                (_, Some(n)) if is_field(n + 1) => parts[n] = None,
                (Some(p), _) => parts[p] = None,
                (None, Some(n)) => parts[n] = None,
                (None, None) => {}
            }
        }

        let joined: String = parts.into_iter().flatten().collect();
        let joined = if missing.is_empty() {
            joined.as_str()
        } else {
            joined.trim_matches(DANGLING)
        };
        let rendered = sanitize_segment(joined);
        Some(rendered).filter(|s| !s.is_empty())
    }
}

/// Removes an opening bracket ending `parts[p]` together with the matching
/// closer starting `parts[n]`.
fn strip_brackets(parts: &mut [Option<String>], p: usize, n: usize) -> bool {
    let (Some(before), Some(after)) = (parts[p].as_deref(), parts[n].as_deref()) else {
        return false;
    };
    let before = before.trim_end();
    let after = after.trim_start();
    let Some(&(_, close)) = BRACKETS
        .iter()
        .find(|(open, _)| before.ends_with(*open))
    else {
        return false;
    };
    if !after.starts_with(close) {
        return false;
    }

    let new_before = before[..before.len() - 1].to_string();
    let new_after = after[close.len_utf8()..].to_string();
    parts[p] = Some(new_before).filter(|s| !s.is_empty());
    parts[n] = Some(new_after).filter(|s| !s.is_empty());
    true
}

/// A parsed, validated organize template. The last segment names the file;
/// the source's extension is appended to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let trimmed = template.trim();
        if trimmed.is_empty() {
            return Err(TemplateError::Empty);
        }
        if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute()
        {
            return Err(TemplateError::Absolute(trimmed.to_string()));
        }

        let mut segments = Vec::new();
        let mut offset = template.len() - template.trim_start().len();
        for raw in trimmed.split('/') {
            if raw.trim() == ".." {
                return Err(TemplateError::ParentSegment);
            }
            let segment = parse_segment(raw, offset)?;
            offset += raw.len() + 1;
            if !segment.tokens.is_empty() {
                segments.push(segment);
            }
        }

        if segments.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Renders the destination path relative to the library root.
    pub fn render(&self, meta: &BookMetadata, source: &Path) -> PathBuf {
        let (dirs, last) = self.segments.split_at(self.segments.len() - 1);

        let mut path = PathBuf::new();
        for segment in dirs {
            if let Some(rendered) = segment.render(meta) {
                path.push(rendered);
            }
        }

        let stem = last[0]
            .render(meta)
            .or_else(|| Field::Title.value(meta))
            .or_else(|| file_stem(source).map(|s| sanitize_segment(&s)))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "book".to_string());
        path.push(file_name(&stem, &book_extension(source)));
        path
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_segment(raw: &str, offset: usize) -> Result<Segment, TemplateError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (j, c) in chars.by_ref() {
                    match c {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(TemplateError::UnbalancedBrace(offset + j)),
                        _ => name.push(c),
                    }
                }
                if !closed {
                    return Err(TemplateError::UnbalancedBrace(offset + i));
                }
                let field = name.trim().parse::<Field>()?;
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Field(field));
            }
            '}' => return Err(TemplateError::UnbalancedBrace(offset + i)),
            _ => literal.push(c),
        }
    }

    if !literal.trim().is_empty() || (!literal.is_empty() && !tokens.is_empty()) {
        tokens.push(Token::Literal(literal));
    }
    Ok(Segment { tokens })
}
