//! Writing resolved metadata back into EPUB-family files.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use log::debug;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::metadata::opf::{attribute, package_path, read_entry};
use crate::metadata::BookMetadata;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding is not supported for '{0}'")]
    Unsupported(PathBuf),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("package document error: {0}")]
    Xml(String),
}

impl From<zip::result::ZipError> for EmbedError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

pub trait Embedder: Send + Sync {
    /// Rewrites `meta` into the file at `path` in place.
    fn embed(&self, path: &Path, meta: &BookMetadata) -> Result<(), EmbedError>;
}

/// Replaces the managed elements of an EPUB's OPF `<metadata>` block. The
/// archive is rebuilt next to the original and renamed over it, so a
/// failure leaves the original intact.
pub struct OpfEmbedder;

impl OpfEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpfEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for OpfEmbedder {
    fn embed(&self, path: &Path, meta: &BookMetadata) -> Result<(), EmbedError> {
        if !is_epub_family(path) {
            return Err(EmbedError::Unsupported(path.to_path_buf()));
        }

        let tmp = temp_path(path);
        match write_embedded(path, &tmp, meta) {
            Ok(()) => std::fs::rename(&tmp, path).map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                EmbedError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }
}

fn is_epub_family(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "epub" | "kepub"))
        .unwrap_or(false)
}

/// Hidden sibling so the watcher ignores it.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("book");
    path.with_file_name(format!(".{}.kobold-tmp", name))
}

fn write_embedded(source: &Path, tmp: &Path, meta: &BookMetadata) -> Result<(), EmbedError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: std::io::Error| EmbedError::Io { path, source: e }
    };

    let file = File::open(source).map_err(io_err(source))?;
    let mut archive = ZipArchive::new(file)?;
    let opf_path =
        package_path(&mut archive).map_err(|e| EmbedError::Archive(e.to_string()))?;
    let opf = read_entry(&mut archive, &opf_path).map_err(|e| EmbedError::Archive(e.to_string()))?;
    let rewritten = rewrite_opf(&opf, meta)?;

    let out = File::create(tmp).map_err(io_err(tmp))?;
    let mut writer = ZipWriter::new(out);

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if entry.name() == opf_path {
            // Keeping the entry's timestamp makes the output a function of
            // the input, so identical books stay identical after a rewrite.
            let modified = entry.last_modified().unwrap_or_default();
            drop(entry);
            writer.start_file(
                opf_path.clone(),
                SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .last_modified_time(modified),
            )?;
            writer
                .write_all(rewritten.as_bytes())
                .map_err(io_err(tmp))?;
        } else {
            writer.raw_copy_file(entry)?;
        }
    }

    let out = writer.finish()?;
    out.sync_all().map_err(io_err(tmp))?;
    debug!("Rewrote {} in {}", opf_path, source.display());
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Managed {
    Title,
    Creator,
    Language,
    Subject,
    Date,
    Series,
    SeriesIndex,
}

impl Managed {
    fn for_element(local_name: &[u8]) -> Option<Self> {
        Some(match local_name {
            b"title" => Self::Title,
            b"creator" => Self::Creator,
            b"language" => Self::Language,
            b"subject" => Self::Subject,
            b"date" => Self::Date,
            _ => return None,
        })
    }

    fn for_meta(e: &BytesStart<'_>) -> Option<Self> {
        match attribute(e, "name")?.as_str() {
            "calibre:series" => Some(Self::Series),
            "calibre:series_index" => Some(Self::SeriesIndex),
            _ => None,
        }
    }
}

/// The values to write, in output order. Fields without a value are not
/// managed: existing elements for them are kept as they are.
fn managed_values(meta: &BookMetadata) -> Vec<(Managed, String)> {
    let mut values = Vec::new();
    let mut push = |field: Managed, value: Option<String>| {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            values.push((field, v));
        }
    };
    push(Managed::Title, meta.title.clone());
    push(Managed::Creator, meta.author.clone());
    push(Managed::Language, meta.language.clone());
    push(Managed::Subject, meta.genre.clone());
    push(Managed::Date, meta.year.map(|y| format!("{:04}", y)));
    push(Managed::Series, meta.series.clone());
    push(
        Managed::SeriesIndex,
        meta.series_index.map(|i| {
            if i.fract() == 0.0 {
                format!("{:.1}", i)
            } else {
                i.to_string()
            }
        }),
    );
    values
}

fn xml_err(e: impl std::fmt::Display) -> EmbedError {
    EmbedError::Xml(e.to_string())
}

/// Streams the OPF through, dropping managed elements that will be replaced
/// and appending the new ones just before `</metadata>`.
pub fn rewrite_opf(opf: &str, meta: &BookMetadata) -> Result<String, EmbedError> {
    let values = managed_values(meta);
    let replaced = |field: Managed| values.iter().any(|(f, _)| *f == field);

    let mut reader = Reader::from_str(opf);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut in_metadata = false;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        match &event {
            Event::Start(e) if e.local_name().as_ref() == b"metadata" => in_metadata = true,
            Event::Start(e) if in_metadata => {
                let skip = match e.local_name().as_ref() {
                    b"meta" => Managed::for_meta(e),
                    other => Managed::for_element(other),
                }
                .is_some_and(replaced);
                if skip {
                    let end = e.to_end().into_owned();
                    reader.read_to_end(end.name()).map_err(xml_err)?;
                    continue;
                }
            }
            Event::Empty(e) if in_metadata && e.local_name().as_ref() == b"meta" => {
                if Managed::for_meta(e).is_some_and(replaced) {
                    continue;
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"metadata" => {
                write_managed(&mut writer, &values)?;
                in_metadata = false;
            }
            Event::Eof => break,
            _ => {}
        }
        writer.write_event(event).map_err(xml_err)?;
    }

    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_err)
}

fn write_managed(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    values: &[(Managed, String)],
) -> Result<(), EmbedError> {
    for (field, value) in values {
        let element = match field {
            Managed::Title => "dc:title",
            Managed::Creator => "dc:creator",
            Managed::Language => "dc:language",
            Managed::Subject => "dc:subject",
            Managed::Date => "dc:date",
            Managed::Series | Managed::SeriesIndex => {
                let name = if *field == Managed::Series {
                    "calibre:series"
                } else {
                    "calibre:series_index"
                };
                let mut el = BytesStart::new("meta");
                el.push_attribute(("name", name));
                el.push_attribute(("content", value.as_str()));
                writer.write_event(Event::Empty(el)).map_err(xml_err)?;
                continue;
            }
        };
        writer
            .write_event(Event::Start(BytesStart::new(element)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new(element)))
            .map_err(xml_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::opf::read_metadata;
    use crate::metadata::{EmbeddedProvider, Fingerprint, MetadataProvider};
    use tempfile::TempDir;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="uid" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Untitled</dc:title>
    <dc:creator>Unknown</dc:creator>
    <dc:identifier id="uid">urn:uuid:42</dc:identifier>
    <dc:language>en</dc:language>
    <meta name="calibre:series" content="Old"/>
  </metadata>
  <manifest><item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/></manifest>
</package>"#;

    fn write_epub(path: &Path) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        zip.start_file(
            "mimetype",
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        )
        .unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(
            br#"<container><rootfiles><rootfile full-path="OEBPS/content.opf"/></rootfiles></container>"#,
        )
        .unwrap();
        zip.start_file("OEBPS/content.opf", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(OPF.as_bytes()).unwrap();
        zip.start_file("OEBPS/c1.xhtml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<html><body>To be</body></html>").unwrap();
        zip.finish().unwrap();
    }

    fn hamlet() -> BookMetadata {
        BookMetadata {
            title: Some("Hamlet".into()),
            author: Some("William Shakespeare".into()),
            series: Some("Tragedies & Histories".into()),
            series_index: Some(3.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_rewrite_replaces_only_managed_fields() {
        let out = rewrite_opf(OPF, &hamlet()).unwrap();
        let meta = read_metadata(&out).unwrap();

        assert_eq!(meta.title.as_deref(), Some("Hamlet"));
        assert_eq!(meta.author.as_deref(), Some("William Shakespeare"));
        assert_eq!(meta.series.as_deref(), Some("Tragedies & Histories"));
        assert_eq!(meta.series_index, Some(3.0));
        // not provided, so the original element stays
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert!(out.contains("urn:uuid:42"));
        assert!(!out.contains("Untitled"));
        assert!(!out.contains("content=\"Old\""));
    }

    #[test]
    fn test_embed_round_trips_through_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.epub");
        write_epub(&path);

        OpfEmbedder::new().embed(&path, &hamlet()).unwrap();

        let meta = EmbeddedProvider::new()
            .lookup(&Fingerprint::for_file(&path))
            .unwrap()
            .unwrap();
        assert_eq!(meta.title.as_deref(), Some("Hamlet"));

        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 4);
        assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");
        assert!(archive.by_name("OEBPS/c1.xhtml").is_ok());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_pdf_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.5").unwrap();

        assert!(matches!(
            OpfEmbedder::new().embed(&path, &hamlet()),
            Err(EmbedError::Unsupported(_))
        ));
    }

    #[test]
    fn test_broken_archive_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.epub");
        std::fs::write(&path, b"not a zip").unwrap();

        assert!(OpfEmbedder::new().embed(&path, &hamlet()).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"not a zip");
        assert!(!temp_path(&path).exists());
    }
}
