//! Goodreads book search lookup.

use std::sync::LazyLock;
use std::time::Duration;

use log::debug;
use quick_xml::escape::unescape;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT_LANGUAGE;
use reqwest::StatusCode;

use super::{BookMetadata, Fingerprint, MetadataProvider, ProviderError};

const BASE_URL: &str = "https://www.goodreads.com";

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

static RE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<tr[^>]*itemtype="http://schema.org/Book"[^>]*>.*?</tr>"#).unwrap()
});
static RE_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)class="bookTitle"[^>]*>\s*<span[^>]*>\s*([^<]+?)\s*</span>"#).unwrap()
});
static RE_AUTHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)class="authorName"[^>]*>\s*<span[^>]*>\s*([^<]+?)\s*</span>"#).unwrap()
});
static RE_PUBLISHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"published\s+(\d{4})").unwrap());
/// `Dune Messiah (Dune, #2)`
static RE_SERIES_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\s*\(([^()#]+?),?\s*#(\d+(?:\.\d+)?)\)$").unwrap()
});

/// Looks books up on the Goodreads search page.
pub struct GoodreadsProvider {
    base_url: String,
    client: Client,
}

impl GoodreadsProvider {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_base_url(BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn search_terms(query: &Fingerprint) -> Option<String> {
        if let Some(isbn) = &query.isbn {
            return Some(isbn.clone());
        }
        let title = query.title.as_deref()?;
        Some(match &query.author {
            Some(author) => format!("{} {}", title, author),
            None => title.to_string(),
        })
    }
}

impl MetadataProvider for GoodreadsProvider {
    fn name(&self) -> &str {
        "goodreads"
    }

    fn lookup(&self, query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError> {
        let Some(terms) = Self::search_terms(query) else {
            return Ok(None);
        };
        debug!("Goodreads search for '{}'", terms);

        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", terms.as_str()), ("search_type", "books")])
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.8")
            .send()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                return Err(ProviderError::RateLimited)
            }
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(ProviderError::Network(format!("HTTP {}", status)))
            }
            _ => {}
        }

        let body = response
            .text()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let mut meta = parse_search_results(&body);
        if let (Some(found), Some(isbn)) = (meta.as_mut(), &query.isbn) {
            found.isbn = Some(isbn.clone());
        }
        Ok(meta)
    }
}

/// Extracts the first result row. Goodreads appends the series to the
/// title, which is split back out.
pub fn parse_search_results(html: &str) -> Option<BookMetadata> {
    let row = RE_ROW.find(html)?.as_str();
    let capture = |re: &Regex| {
        re.captures(row)
            .and_then(|c| c.get(1))
            .map(|m| decode_entities(m.as_str()))
    };

    let mut meta = BookMetadata {
        author: capture(&RE_AUTHOR),
        year: capture(&RE_PUBLISHED).and_then(|y| y.parse().ok()),
        ..Default::default()
    };
    if let Some(title) = capture(&RE_TITLE) {
        match RE_SERIES_SUFFIX.captures(&title) {
            Some(parts) => {
                meta.title = Some(parts[1].to_string());
                meta.series = Some(parts[2].trim().to_string());
                meta.series_index = parts[3].parse().ok();
            }
            None => meta.title = Some(title),
        }
    }

    let meta = meta.normalized();
    (!meta.is_empty()).then_some(meta)
}

fn decode_entities(raw: &str) -> String {
    unescape(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<table class="tableList">
<tr itemscope itemtype="http://schema.org/Book">
  <td><a class="bookTitle" itemprop="url" href="/book/show/106.Dune_Messiah">
    <span itemprop='name' role='heading' aria-level='4'>Dune Messiah (Dune, #2)</span></a>
    <span class='by'>by</span>
    <span itemprop='author' itemscope itemtype='http://schema.org/Person'>
      <a class="authorName" itemprop="url" href="/author/show/58.Frank_Herbert"><span itemprop="name">Frank Herbert</span></a>
    </span>
    <span class="greyText smallText uitext">4.89 avg rating &mdash; published 1969 &mdash; 213 editions</span>
  </td>
</tr>
<tr itemscope itemtype="http://schema.org/Book">
  <td><a class="bookTitle" href="/x"><span>Other</span></a></td>
</tr>
</table>"#;

    #[test]
    fn test_parses_first_row_and_splits_series() {
        let meta = parse_search_results(PAGE).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Dune Messiah"));
        assert_eq!(meta.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(meta.series.as_deref(), Some("Dune"));
        assert_eq!(meta.series_index, Some(2.0));
        assert_eq!(meta.year, Some(1969));
    }

    #[test]
    fn test_title_without_series() {
        let page = r#"<tr itemscope itemtype="http://schema.org/Book">
            <a class="bookTitle" href="/b"><span itemprop='name'>Hamlet &amp; Others</span></a>
            </tr>"#;
        let meta = parse_search_results(page).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Hamlet & Others"));
        assert!(meta.series.is_none());
    }

    #[test]
    fn test_empty_page_is_none() {
        assert!(parse_search_results("<html><body>No results.</body></html>").is_none());
    }
}
