//! URL handling module for crawl-ledger
//!
//! Normalization turns raw links into record keys; [`CrawlScope`] decides
//! which normalized links are admitted to the frontier.

mod normalize;

use crate::config::ScopeConfig;
use url::Url;

pub use normalize::normalize_url;

/// Filter applied to every discovered link
#[derive(Debug, Clone, Default)]
pub struct CrawlScope {
    url_prefix: Option<String>,
    allowed_domain: Option<String>,
    strip_query: bool,
}

impl CrawlScope {
    pub fn new(config: &ScopeConfig) -> Self {
        Self {
            url_prefix: config.url_prefix.clone(),
            allowed_domain: config.allowed_domain.as_ref().map(|d| d.to_lowercase()),
            strip_query: config.strip_query,
        }
    }

    /// A scope that admits every http(s) URL
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Normalizes `href` relative to `base` and returns it if it is in scope
    ///
    /// # Examples
    ///
    /// ```
    /// use crawl_ledger::config::ScopeConfig;
    /// use crawl_ledger::url::CrawlScope;
    /// use url::Url;
    ///
    /// let scope = CrawlScope::new(&ScopeConfig {
    ///     url_prefix: Some("https://example.com/docs".into()),
    ///     allowed_domain: Some("example.com".into()),
    ///     strip_query: true,
    ///     content_selector: None,
    /// });
    /// let base = Url::parse("https://example.com/docs/index").unwrap();
    ///
    /// assert_eq!(
    ///     scope.admit(&base, "guide?lang=en#top").as_deref(),
    ///     Some("https://example.com/docs/guide")
    /// );
    /// assert_eq!(scope.admit(&base, "/blog"), None);
    /// ```
    pub fn admit(&self, base: &Url, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            return None;
        }

        let joined = base.join(href).ok()?;
        let url = normalize::normalize_parsed(joined, self.strip_query).ok()?;

        self.contains(&url).then(|| url.into())
    }

    /// Normalizes a configured seed URL; seeds bypass the scope filter
    pub fn normalize_seed(&self, seed: &str) -> crate::UrlResult<String> {
        normalize_url(seed, self.strip_query).map(String::from)
    }

    fn contains(&self, url: &Url) -> bool {
        if let Some(domain) = &self.allowed_domain {
            if url.host_str() != Some(domain.as_str()) {
                return false;
            }
        }

        match &self.url_prefix {
            Some(prefix) => url.as_str().starts_with(prefix.as_str()),
            None => true,
        }
    }
}
