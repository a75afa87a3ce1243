//! Builders for test e-books and configurations.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use kobold::{Config, ConfigError};

/// Builds a minimal but well-formed EPUB archive.
#[derive(Default)]
pub struct EpubBuilder {
    title: Option<String>,
    author: Option<String>,
    series: Option<(String, f64)>,
    language: Option<String>,
    body: String,
}

impl EpubBuilder {
    pub fn new() -> Self {
        Self {
            body: "<p>Once upon a time.</p>".to_string(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn series(mut self, name: &str, index: f64) -> Self {
        self.series = Some((name.to_string(), index));
        self
    }

    pub fn language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// Distinguishes otherwise identical books by content.
    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    fn opf(&self) -> String {
        let mut meta = String::new();
        if let Some(title) = &self.title {
            meta.push_str(&format!("<dc:title>{}</dc:title>", title));
        }
        if let Some(author) = &self.author {
            meta.push_str(&format!("<dc:creator>{}</dc:creator>", author));
        }
        if let Some(language) = &self.language {
            meta.push_str(&format!("<dc:language>{}</dc:language>", language));
        }
        if let Some((name, index)) = &self.series {
            meta.push_str(&format!(
                r#"<meta name="calibre:series" content="{}"/><meta name="calibre:series_index" content="{}"/>"#,
                name, index
            ));
        }
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="id">
<metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">{}</metadata>
<manifest><item id="text" href="text.xhtml" media-type="application/xhtml+xml"/></manifest>
<spine><itemref idref="text"/></spine>
</package>"#,
            meta
        )
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let stored =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

        zip.start_file("mimetype", stored).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
<rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
        )
        .unwrap();
        zip.start_file("OEBPS/content.opf", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(self.opf().as_bytes()).unwrap();
        zip.start_file("OEBPS/text.xhtml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(
            format!(
                "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body>{}</body></html>",
                self.body
            )
            .as_bytes(),
        )
        .unwrap();
        zip.finish().unwrap();
    }
}

/// Builds the environment-style key/value set `Config::from_vars` reads.
pub struct ConfigBuilder {
    vars: Vec<(String, String)>,
}

impl ConfigBuilder {
    /// Token set, every optional stage off, fast timers.
    pub fn new(watch_dir: &Path, data_dir: &Path) -> Self {
        Self {
            vars: vec![
                ("USER_TOKEN".into(), "test-token".into()),
                ("WATCH_DIRS".into(), watch_dir.display().to_string()),
                ("DATA_PATH".into(), data_dir.display().to_string()),
                ("WORKER_POLL_INTERVAL".into(), "1".into()),
                ("CONVERT_EPUB".into(), "false".into()),
                ("EMBED_METADATA".into(), "false".into()),
                ("FETCH_EXTERNAL_METADATA".into(), "false".into()),
                ("ORGANIZE_LIBRARY".into(), "false".into()),
                ("WATCH_DEBOUNCE_MS".into(), "100".into()),
                ("WATCH_POLL_DELAY_MS".into(), "50".into()),
                ("SHUTDOWN_GRACE".into(), "5".into()),
            ],
        }
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.vars.retain(|(k, _)| k != key);
        self.vars.push((key.to_string(), value.to_string()));
        self
    }

    pub fn organize(self, template: &str) -> Self {
        self.set("ORGANIZE_LIBRARY", "true")
            .set("ORGANIZE_TEMPLATE", template)
    }

    pub fn try_build(self) -> Result<Config, ConfigError> {
        Config::from_vars(self.vars)
    }

    pub fn build(self) -> Config {
        self.try_build().expect("test config should be valid")
    }
}
