//! EPUB package document (OPF) parsing.

use std::io::{Read, Seek};

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::isbn::parse_isbn;
use super::{BookMetadata, ProviderError};

pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Locates the OPF inside an EPUB archive via `META-INF/container.xml`.
pub fn package_path<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<String, ProviderError> {
    let container = read_entry(archive, CONTAINER_PATH)?;
    rootfile_path(&container)
}

/// Reads a text entry from an archive.
pub fn read_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<String, ProviderError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| ProviderError::Malformed(format!("missing {}: {}", name, e)))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| ProviderError::Malformed(format!("failed to read {}: {}", name, e)))?;
    Ok(content)
}

fn rootfile_path(container_xml: &str) -> Result<String, ProviderError> {
    let mut reader = Reader::from_str(container_xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                if let Some(path) = attribute(e, "full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::Malformed(format!(
                    "container.xml parse error: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    Err(ProviderError::Malformed(
        "container.xml names no rootfile".to_string(),
    ))
}

/// Extracts the `<metadata>` block of an OPF package document.
pub fn read_metadata(opf_xml: &str) -> Result<BookMetadata, ProviderError> {
    let mut reader = Reader::from_str(opf_xml);
    reader.config_mut().trim_text(true);

    let mut meta = BookMetadata::default();
    let mut in_metadata = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"metadata" => in_metadata = true,
                    b"title" | b"creator" | b"language" | b"subject" | b"date"
                    | b"identifier"
                        if in_metadata =>
                    {
                        let field = local.as_ref().to_vec();
                        let end = e.to_end().into_owned();
                        let raw = reader.read_text(end.name()).map_err(|e| {
                            ProviderError::Malformed(format!("OPF parse error: {}", e))
                        })?;
                        let text = unescape(&raw)
                            .map(|t| t.trim().to_string())
                            .unwrap_or_else(|_| raw.trim().to_string());
                        apply_dc_field(&mut meta, &field, text);
                    }
                    b"meta" if in_metadata => apply_meta(&mut meta, e),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) if in_metadata && e.local_name().as_ref() == b"meta" => {
                apply_meta(&mut meta, e)
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"metadata" => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::Malformed(format!("OPF parse error: {}", e)));
            }
            _ => {}
        }
    }

    Ok(meta.normalized())
}

fn apply_dc_field(meta: &mut BookMetadata, field: &[u8], text: String) {
    if text.is_empty() {
        return;
    }
    match field {
        b"title" => {
            meta.title.get_or_insert(text);
        }
        b"creator" => {
            meta.author.get_or_insert(text);
        }
        b"language" => {
            meta.language.get_or_insert(text);
        }
        b"subject" => {
            meta.genre.get_or_insert(text);
        }
        b"date" => {
            if meta.year.is_none() {
                meta.year = parse_year(&text);
            }
        }
        b"identifier" => {
            if meta.isbn.is_none() {
                meta.isbn = parse_isbn(&text);
            }
        }
        _ => {}
    }
}

fn apply_meta(meta: &mut BookMetadata, e: &BytesStart<'_>) {
    let (Some(name), Some(content)) = (attribute(e, "name"), attribute(e, "content")) else {
        return;
    };
    match name.as_str() {
        "calibre:series" => {
            meta.series.get_or_insert(content);
        }
        "calibre:series_index" => {
            if meta.series_index.is_none() {
                meta.series_index = content.trim().parse::<f64>().ok();
            }
        }
        "cover" => {
            meta.cover_ref.get_or_insert(content);
        }
        _ => {}
    }
}

/// Leading four-digit year of a date such as `1603`, `1603-01-01` or
/// `D:19990101`.
pub fn parse_year(date: &str) -> Option<i32> {
    let digits: String = date
        .trim()
        .trim_start_matches("D:")
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() < 4 {
        return None;
    }
    digits[..4].parse().ok()
}

pub(crate) fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.local_name().as_ref() != key.as_bytes() {
            return None;
        }
        let raw = String::from_utf8_lossy(&attr.value).to_string();
        Some(unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw))
    })
}
