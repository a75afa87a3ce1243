//! Amazon book search lookup.

use std::sync::LazyLock;
use std::time::Duration;

use log::debug;
use quick_xml::escape::unescape;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_LANGUAGE, COOKIE};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use super::opf::parse_year;
use super::{BookMetadata, Fingerprint, MetadataProvider, ProviderError};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

static RE_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)data-component-type="s-search-result".*?(?:data-component-type="s-search-result"|$)"#)
        .unwrap()
});
static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<h2[^>]*>.*?<span[^>]*>\s*([^<]+?)\s*</span>").unwrap());
static RE_AUTHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)>\s*by\s*</span>\s*(?:<a[^>]*>|<span[^>]*>)\s*([^<]+?)\s*<").unwrap()
});
static RE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"a-color-secondary a-text-normal">\s*([^<]*?\d{4})\s*</span>"#).unwrap()
});
static RE_SERIES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Book\s+(\d+(?:\.\d+)?)\s+of\s+\d+:\s*([^<]+?)\s*<").unwrap());

/// Looks books up on an Amazon storefront's search page. The session cookie
/// is optional; without it Amazon rate-limits sooner.
pub struct AmazonProvider {
    base_url: String,
    cookie: Option<SecretString>,
    client: Client,
}

impl AmazonProvider {
    pub fn new(
        domain: &str,
        cookie: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = format!("https://www.amazon.{}", domain.trim_start_matches('.'));
        Self::with_base_url(base_url, cookie, timeout)
    }

    /// Points the provider at an arbitrary storefront root.
    pub fn with_base_url(
        base_url: impl Into<String>,
        cookie: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookie,
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

impl MetadataProvider for AmazonProvider {
    fn name(&self) -> &str {
        "amazon"
    }

    fn lookup(&self, query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError> {
        let Some(terms) = Self::search_terms(query) else {
            return Ok(None);
        };
        debug!("Amazon search for '{}'", terms);

        let mut request = self
            .client
            .get(format!("{}/s", self.base_url))
            .query(&[("k", terms.as_str()), ("i", "stripbooks")])
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.8");
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie.expose_secret());
        }

        let response = request
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

/// Extracts the first search result. `None` when the page lists nothing.
pub fn parse_search_results(html: &str) -> Option<BookMetadata> {
    let first = RE_RESULT.find(html)?.as_str();

    let capture = |re: &Regex| {
        re.captures(first)
            .and_then(|c| c.get(1))
            .map(|m| decode_entities(m.as_str()))
    };

    let mut meta = BookMetadata {
        title: capture(&RE_TITLE),
        author: capture(&RE_AUTHOR),
        year: capture(&RE_DATE).and_then(|d| {
            d.split_whitespace()
                .rev()
                .find_map(|word| parse_year(word.trim_end_matches(',')))
        }),
        ..Default::default()
    };
    if let Some(series) = RE_SERIES.captures(first) {
        meta.series_index = series[1].parse().ok();
        meta.series = Some(decode_entities(&series[2]));
    }

    let meta = meta.normalized();
    (!meta.is_empty()).then_some(meta)
}

fn decode_entities(raw: &str) -> String {
    let cleaned = raw.replace("&nbsp;", " ");
    unescape(&cleaned)
        .map(|s| s.into_owned())
        .unwrap_or(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="s-main-slot">
  <div data-component-type="s-search-result" data-asin="B000FC1PJI">
    <h2 class="a-size-mini"><a class="a-link-normal" href="/dp/B000FC1PJI">
      <span class="a-size-medium a-color-base a-text-normal">Hamlet &amp; Other Plays</span></a></h2>
    <div class="a-row"><span class="a-size-base">by </span>
      <a class="a-size-base a-link-normal" href="/e/B000AQ0842">William Shakespeare</a>
      <span class="a-size-base a-color-secondary a-text-normal">Jan 1, 2003</span></div>
    <a class="a-link-normal" href="/series">Book 2 of 5: Tragedies</a>
  </div>
  <div data-component-type="s-search-result" data-asin="OTHER">
    <h2><a><span>Unrelated</span></a></h2>
  </div>
</div>"#;

    #[test]
    fn test_parses_first_result() {
        let meta = parse_search_results(PAGE).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Hamlet & Other Plays"));
        assert_eq!(meta.author.as_deref(), Some("William Shakespeare"));
        assert_eq!(meta.year, Some(2003));
        assert_eq!(meta.series.as_deref(), Some("Tragedies"));
        assert_eq!(meta.series_index, Some(2.0));
    }

    #[test]
    fn test_no_results_is_none() {
        assert!(parse_search_results("<html><body>No results</body></html>").is_none());
    }

    #[test]
    fn test_search_terms_prefer_isbn() {
        let mut query = Fingerprint::for_file(std::path::Path::new("/lib/hamlet.epub"));
        assert_eq!(AmazonProvider::search_terms(&query), None);

        query.title = Some("Hamlet".into());
        query.author = Some("William Shakespeare".into());
        assert_eq!(
            AmazonProvider::search_terms(&query).as_deref(),
            Some("Hamlet William Shakespeare")
        );

        query.isbn = Some("9780743477123".into());
        assert_eq!(
            AmazonProvider::search_terms(&query).as_deref(),
            Some("9780743477123")
        );
    }
}
