use std::fs::File;
use std::path::Path;

use log::debug;
use lopdf::{Dictionary, Document, Object};

use super::isbn::find_isbn;
use super::opf::{package_path, parse_year, read_entry, read_metadata};
use super::{BookMetadata, Fingerprint, MetadataProvider, ProviderError};

/// Reads metadata stored inside the file itself: the OPF package of EPUB
/// and KEPUB archives, or the Info dictionary of a PDF.
pub struct EmbeddedProvider;

impl EmbeddedProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EmbeddedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataProvider for EmbeddedProvider {
    fn name(&self) -> &str {
        "embedded"
    }

    fn lookup(&self, query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError> {
        let ext = query
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let meta = match ext.as_str() {
            "epub" | "kepub" => read_epub(&query.path)?,
            "pdf" => read_pdf(&query.path)?,
            _ => {
                debug!("No embedded reader for {}", query.path.display());
                return Ok(None);
            }
        };

        Ok((!meta.is_empty()).then_some(meta))
    }
}

fn read_epub(path: &Path) -> Result<BookMetadata, ProviderError> {
    let file = File::open(path).map_err(|e| ProviderError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| ProviderError::Malformed(format!("not an EPUB archive: {}", e)))?;

    let opf_path = package_path(&mut archive)?;
    let opf = read_entry(&mut archive, &opf_path)?;
    read_metadata(&opf)
}

fn read_pdf(path: &Path) -> Result<BookMetadata, ProviderError> {
    let doc = Document::load(path)
        .map_err(|e| ProviderError::Malformed(format!("unreadable PDF: {}", e)))?;

    let Some(info) = info_dictionary(&doc) else {
        return Ok(BookMetadata::default());
    };

    let meta = BookMetadata {
        title: text_entry(info, b"Title"),
        author: text_entry(info, b"Author"),
        genre: text_entry(info, b"Subject"),
        year: text_entry(info, b"CreationDate").and_then(|d| parse_year(&d)),
        isbn: text_entry(info, b"Keywords").and_then(|k| find_isbn(&k)),
        ..Default::default()
    };
    Ok(meta.normalized())
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn text_entry(dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok()? {
        Object::String(bytes, _) => Some(decode_pdf_text(bytes)),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE when they carry a BOM, otherwise
/// PDFDocEncoding, which matches Latin-1 for printable text.
fn decode_pdf_text(bytes: &[u8]) -> String {
    if let Some(body) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}
