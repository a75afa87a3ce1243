//! Rendering properties of organize templates over many metadata shapes.

use std::path::{Component, Path};

use kobold::metadata::BookMetadata;
use kobold::organizer::filename::MAX_SEGMENT_BYTES;
use kobold::PathTemplate;

const TEMPLATES: &[&str] = &[
    "{author}/{title}",
    "{author}/{series}/{series_index} - {title}",
    "{language}/{genre}/{author}/{year} - {title}",
    "{author}/[{series} #{series_index}] {title}",
    "Books/{author}/{series}/{title}",
    "{genre}/{author} - {title} ({year})",
    "{series}/{series_index}",
    "{author}",
];

const ILLEGAL: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

fn metadata_variants() -> Vec<BookMetadata> {
    let full = BookMetadata {
        author: Some("William Shakespeare".into()),
        title: Some("Hamlet".into()),
        series: Some("Tragedies".into()),
        series_index: Some(2.0),
        language: Some("en".into()),
        genre: Some("Drama".into()),
        year: Some(1603),
        ..Default::default()
    };
    let hostile = BookMetadata {
        author: Some("AC/DC: \"Live\"".into()),
        title: Some("What? Why* <Now>...".into()),
        series: Some("  . ".into()),
        series_index: Some(1.5),
        language: Some("en|fr".into()),
        genre: Some("\u{7}bell".into()),
        year: Some(2001),
        ..Default::default()
    };
    let long = BookMetadata {
        author: Some("A".repeat(400)),
        title: Some("T".repeat(400)),
        ..Default::default()
    };

    let wide = BookMetadata {
        author: Some("村上春樹".repeat(40)),
        title: Some("魔".repeat(120)),
        series: Some("ø".repeat(150)),
        ..Default::default()
    };

    let mut variants = vec![BookMetadata::default(), full.clone(), hostile, long, wide];
    // Drop each field of the full record in turn.
    for i in 0..7 {
        let mut m = full.clone();
        match i {
            0 => m.author = None,
            1 => m.title = None,
            2 => m.series = None,
            3 => m.series_index = None,
            4 => m.language = None,
            5 => m.genre = None,
            _ => m.year = None,
        }
        variants.push(m);
    }
    variants.push(BookMetadata {
        title: Some("Only A Title".into()),
        ..Default::default()
    });
    variants
}

fn assert_well_formed(rendered: &Path, template: &str, meta: &BookMetadata) {
    let text = rendered.to_string_lossy();
    assert!(!text.contains("//"), "double separator in {text:?} ({template}, {meta:?})");
    assert!(!text.contains("None"), "literal None in {text:?}");
    assert!(rendered.is_relative(), "absolute path {text:?}");

    let segments: Vec<_> = rendered.components().collect();
    assert!(!segments.is_empty(), "empty path for {template}");
    for component in segments {
        let Component::Normal(segment) = component else {
            panic!("unexpected component {component:?} in {text:?}");
        };
        let segment = segment.to_string_lossy();
        assert!(!segment.is_empty(), "empty segment in {text:?}");
        assert!(
            !segment.contains(ILLEGAL) && !segment.chars().any(char::is_control),
            "illegal character in {segment:?}"
        );
        assert!(!segment.ends_with(' ') && !segment.ends_with('.') || segment.ends_with(".epub"));
        assert!(segment.len() <= MAX_SEGMENT_BYTES, "segment too long");
    }
    assert!(text.ends_with(".epub"), "extension lost in {text:?}");
}

#[test]
fn test_rendered_paths_are_always_well_formed() {
    let source = Path::new("/watch/incoming/some book.epub");
    for template in TEMPLATES {
        let parsed = PathTemplate::parse(template).unwrap();
        for meta in metadata_variants() {
            let rendered = parsed.render(&meta, source);
            assert_well_formed(&rendered, template, &meta);
        }
    }
}

#[test]
fn test_shakespeare_romeo_and_juliet() {
    let template = PathTemplate::parse("{author}/{title}").unwrap();
    let meta = BookMetadata {
        author: Some("William Shakespeare".into()),
        title: Some("Romeo and Juliet".into()),
        ..Default::default()
    };

    let rendered = template.render(&meta, Path::new("/in/rj.epub"));
    assert_eq!(rendered, Path::new("William Shakespeare/Romeo and Juliet.epub"));
}

#[test]
fn test_missing_series_collapses_segment() {
    let template = PathTemplate::parse("{author}/{series}/{series_index} - {title}").unwrap();
    let meta = BookMetadata {
        author: Some("William Shakespeare".into()),
        title: Some("Hamlet".into()),
        ..Default::default()
    };

    let rendered = template.render(&meta, Path::new("/in/hamlet.epub"));
    assert_eq!(rendered, Path::new("William Shakespeare/Hamlet.epub"));
}

#[test]
fn test_series_index_formatting() {
    let template = PathTemplate::parse("{series}/{series_index} - {title}").unwrap();
    let mut meta = BookMetadata {
        title: Some("Dune".into()),
        series: Some("Dune".into()),
        series_index: Some(1.0),
        ..Default::default()
    };
    assert_eq!(
        template.render(&meta, Path::new("/in/d.epub")),
        Path::new("Dune/01 - Dune.epub")
    );

    meta.series_index = Some(1.5);
    assert_eq!(
        template.render(&meta, Path::new("/in/d.epub")),
        Path::new("Dune/01.5 - Dune.epub")
    );
}
