use crate::{UrlError, UrlResult};
use url::Url;

/// Normalizes a URL for use as a record key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Reject anything that is not http or https
/// 3. Lowercase the host (the parser already does this for special schemes)
/// 4. Remove the fragment
/// 5. Remove the query string when `strip_query` is set, and always drop an empty `?`
///
/// # Examples
///
/// ```
/// use crawl_ledger::url::normalize_url;
///
/// let url = normalize_url("https://Example.com/docs?page=2#intro", true).unwrap();
/// assert_eq!(url.as_str(), "https://example.com/docs");
/// ```
pub fn normalize_url(url_str: &str, strip_query: bool) -> UrlResult<Url> {
    let url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    normalize_parsed(url, strip_query)
}

/// Normalizes an already parsed URL
pub(crate) fn normalize_parsed(mut url: Url, strip_query: bool) -> UrlResult<Url> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    if url.host_str().is_none() {
        return Err(UrlError::MissingHost);
    }

    url.set_fragment(None);

    if strip_query || url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}
