//! Content extraction seam and the default HTML extractor
//!
//! The extractor turns a fetched page into cleaned text plus the set of
//! in-scope outbound links. Link admission goes through [`CrawlScope`], so
//! every URL it returns is already normalized.

use crate::crawler::fetcher::RawPage;
use crate::url::CrawlScope;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeSet;
use thiserror::Error;
use url::Url;

/// Result of extracting a page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Text stored as the record's content on success
    pub cleaned_text: String,

    /// Normalized, in-scope links found on the page
    pub outbound_urls: BTreeSet<String>,

    /// Named things found on the page; opaque to the crawl engine
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Not an HTML document: {0}")]
    NotHtml(String),

    #[error("Content element not found: {0}")]
    MissingContent(String),

    #[error("Invalid page URL: {0}")]
    InvalidUrl(String),
}

/// Turns a fetched page into content and outbound links
pub trait Extractor: Send + Sync {
    fn extract(&self, page_url: &str, raw: &RawPage) -> Result<Extraction, ExtractError>;
}

/// Tags whose text never reaches the cleaned content
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// `scraper`-based extractor
///
/// # Extraction Rules
///
/// - Content is the page title followed by the whitespace-collapsed text of the
///   content root (`<body>` unless a content selector is set)
/// - Links come from every `<a href>` on the page except `download` links, and
///   are resolved against the final URL after redirects
/// - Entities are the `h1`-`h3` heading texts
#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    scope: CrawlScope,
    content_selector: Option<String>,
}

impl HtmlExtractor {
    pub fn new(scope: CrawlScope) -> Self {
        Self {
            scope,
            content_selector: None,
        }
    }

    /// Restricts content to the first element matching `selector`
    ///
    /// Pages without a match fail extraction.
    pub fn with_content_selector(mut self, selector: impl Into<String>) -> Self {
        self.content_selector = Some(selector.into());
        self
    }

    fn content_root<'a>(&self, document: &'a Html) -> Result<Option<ElementRef<'a>>, ExtractError> {
        let css = self.content_selector.as_deref().unwrap_or("body");
        let selector =
            Selector::parse(css).map_err(|_| ExtractError::MissingContent(css.to_string()))?;

        let root = document.select(&selector).next();
        if root.is_none() && self.content_selector.is_some() {
            return Err(ExtractError::MissingContent(css.to_string()));
        }
        Ok(root)
    }
}

impl Extractor for HtmlExtractor {
    fn extract(&self, page_url: &str, raw: &RawPage) -> Result<Extraction, ExtractError> {
        if let Some(content_type) = &raw.content_type {
            if !content_type.contains("html") {
                return Err(ExtractError::NotHtml(content_type.clone()));
            }
        }

        let base = Url::parse(&raw.final_url)
            .or_else(|_| Url::parse(page_url))
            .map_err(|e| ExtractError::InvalidUrl(e.to_string()))?;

        let document = Html::parse_document(&raw.body);

        let title = extract_title(&document);
        let body = self
            .content_root(&document)?
            .map(visible_text)
            .unwrap_or_default();

        let cleaned_text = match title {
            Some(title) if body.is_empty() => title,
            Some(title) => format!("{}\n\n{}", title, body),
            None => body,
        };

        Ok(Extraction {
            cleaned_text,
            outbound_urls: self.extract_links(&document, &base),
            entities: extract_headings(&document),
        })
    }
}

impl HtmlExtractor {
    fn extract_links(&self, document: &Html, base: &Url) -> BTreeSet<String> {
        let mut links = BTreeSet::new();

        if let Ok(a_selector) = Selector::parse("a[href]") {
            for element in document.select(&a_selector) {
                if element.value().attr("download").is_some() {
                    continue;
                }

                if let Some(href) = element.value().attr("href") {
                    if let Some(url) = self.scope.admit(base, href) {
                        links.insert(url);
                    }
                }
            }
        }

        links
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

/// Collects text under `root`, skipping script-like elements
fn visible_text(root: ElementRef<'_>) -> String {
    let mut parts = Vec::new();

    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };

        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|e| SKIPPED_TAGS.contains(&e.name()))
                .unwrap_or(false)
        });

        if !hidden {
            parts.push(&**text);
        }
    }

    collapse_whitespace(&parts.join(" "))
}

fn extract_headings(document: &Html) -> Vec<String> {
    let Ok(selector) = Selector::parse("h1, h2, h3") else {
        return Vec::new();
    };

    document
        .select(&selector)
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
