//! Book metadata records and the provider capability interface.

pub mod amazon;
pub mod embedded;
pub mod goodreads;
pub mod isbn;
pub mod opf;
pub mod resolver;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use amazon::AmazonProvider;
pub use embedded::EmbeddedProvider;
pub use goodreads::GoodreadsProvider;
pub use resolver::{MetadataResolver, Resolution};

/// Metadata for one book. Every field is independently optional because
/// providers routinely return partial records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_index: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_ref: Option<String>,
}

impl BookMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fills every field that is still `None` from `other`. Fields already
    /// set are never overwritten, and a `None` in `other` changes nothing.
    /// Returns the number of fields filled.
    pub fn fill_from(&mut self, other: &BookMetadata) -> usize {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> usize {
            match (slot.is_none(), value) {
                (true, Some(v)) => {
                    *slot = Some(v.clone());
                    1
                }
                _ => 0,
            }
        }

        fill(&mut self.author, &other.author)
            + fill(&mut self.title, &other.title)
            + fill(&mut self.series, &other.series)
            + fill(&mut self.series_index, &other.series_index)
            + fill(&mut self.language, &other.language)
            + fill(&mut self.genre, &other.genre)
            + fill(&mut self.year, &other.year)
            + fill(&mut self.isbn, &other.isbn)
            + fill(&mut self.cover_ref, &other.cover_ref)
    }

    /// Drops values that are blank after trimming, and trims the rest.
    pub fn normalized(mut self) -> Self {
        fn clean(slot: &mut Option<String>) {
            *slot = slot
                .take()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        clean(&mut self.author);
        clean(&mut self.title);
        clean(&mut self.series);
        clean(&mut self.language);
        clean(&mut self.genre);
        clean(&mut self.isbn);
        clean(&mut self.cover_ref);
        self.series_index = self.series_index.filter(|i| i.is_finite() && *i >= 0.0);
        self
    }
}

/// What a provider is asked about: the file plus whatever identifying
/// fields are known so far.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
}

impl Fingerprint {
    pub fn for_file(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            title: None,
            author: None,
            isbn: None,
        }
    }

    /// Refines the fingerprint with what has been resolved so far. The file
    /// stem stands in for a missing title.
    pub fn with_known(mut self, known: &BookMetadata) -> Self {
        self.isbn = known.isbn.clone();
        self.author = known.author.clone();
        self.title = known.title.clone().or_else(|| file_stem(&self.path));
        self
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed file: {0}")]
    Malformed(String),
}

/// A metadata source. Implementations return `Ok(None)` for "not found",
/// which is not an error.
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn lookup(&self, query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError>;
}

/// File stem without any compound e-book suffix (`a.kepub.epub` → `a`).
pub fn file_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".kepub.epub")
        .or_else(|| path.file_stem().and_then(|s| s.to_str()))?;
    let stem = stem.trim();
    (!stem.is_empty()).then(|| stem.to_string())
}
