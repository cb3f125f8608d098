//! Web search and page fetching.
//!
//! Workers only see [`WebSearch`] and [`WebFetch`]; the HTTP
//! implementations here turn a JSON search endpoint and raw HTML pages
//! into plain text with absolute links.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::{ConfigError, ServiceError};

/// Default number of characters of page text kept per page.
pub const DEFAULT_PAGE_CHAR_BUDGET: usize = 40_000;

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result URL.
    pub url: String,
    /// Page title, if the engine returned one.
    #[serde(default)]
    pub title: String,
    /// Snippet or summary.
    #[serde(default, alias = "content", alias = "snippet", alias = "description")]
    pub summary: String,
}

/// A fetched page reduced to text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPage {
    /// Final URL.
    pub url: String,
    /// Document title.
    pub title: String,
    /// Visible text, whitespace-collapsed.
    pub text: String,
    /// Absolute outgoing links, deduplicated in document order.
    pub links: Vec<String>,
}

/// Searches the web.
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Returns hits for `query`, best first.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ServiceError>;
}

/// Fetches pages.
#[async_trait]
pub trait WebFetch: Send + Sync {
    /// Downloads `url` and reduces it to text.
    async fn fetch(&self, url: &str) -> Result<WebPage, ServiceError>;
}

fn map_status(service: &'static str, url: &str, status: reqwest::StatusCode) -> ServiceError {
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
        ServiceError::NotFound {
            service,
            what: url.to_string(),
        }
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ServiceError::Unavailable {
            service,
            message: format!("{url} returned {status}"),
        }
    } else {
        ServiceError::Rejected {
            service,
            message: format!("{url} returned {status}"),
        }
    }
}

fn transport(service: &'static str, err: &reqwest::Error) -> ServiceError {
    ServiceError::Unavailable {
        service,
        message: err.to_string(),
    }
}

/// Fetches pages over HTTP, caching the reduced text.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Arc<TtlCache<String, WebPage>>,
    char_budget: usize,
}

impl HttpFetcher {
    /// Creates a fetcher sharing `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(
        timeout: Duration,
        cache: Arc<TtlCache<String, WebPage>>,
        char_budget: usize,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            cache,
            char_budget,
        })
    }
}

#[async_trait]
impl WebFetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<WebPage, ServiceError> {
        if let Some(page) = self.cache.get(&url.to_string()) {
            debug!(url, "page served from cache");
            return Ok(page);
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport("web_fetch", &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status("web_fetch", url, status));
        }
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| transport("web_fetch", &e))?;
        let page = parse_html(&final_url, &body, self.char_budget);
        debug!(url, chars = page.text.len(), links = page.links.len(), "page fetched");
        self.cache.insert(url.to_string(), page.clone());
        Ok(page)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchBody {
    Wrapped { results: Vec<SearchHit> },
    Bare(Vec<SearchHit>),
}

/// Queries a JSON search endpoint.
///
/// Sends `GET {endpoint}?q=<query>` and accepts either a bare array of hits
/// or `{"results": [...]}`. Each hit needs a `url`; the snippet may be
/// named `summary`, `content`, `snippet` or `description`.
#[derive(Debug, Clone)]
pub struct HttpSearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_results: usize,
}

impl HttpSearch {
    /// Creates a search client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            max_results: 10,
        })
    }
}

#[async_trait]
impl WebSearch for HttpSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ServiceError> {
        let mut request = self.client.get(&self.endpoint).query(&[("q", query)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| transport("web_search", &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status("web_search", &self.endpoint, status));
        }
        let body: SearchBody = response.json().await.map_err(|e| ServiceError::Rejected {
            service: "web_search",
            message: format!("unexpected response shape: {e}"),
        })?;
        let mut hits = match body {
            SearchBody::Wrapped { results } => results,
            SearchBody::Bare(hits) => hits,
        };
        hits.retain(|h| !h.url.is_empty());
        hits.truncate(self.max_results);
        Ok(hits)
    }
}

static TITLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());
static INVISIBLE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template|svg)[^>]*>.*?</(script|style|noscript|template|svg)>|<!--.*?-->").ok()
});
static HREF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"'#]+)"#).ok());
static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").ok());
static SPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Reduces an HTML document to title, text and absolute links.
///
/// Text is truncated to `char_budget` characters.
#[must_use]
pub fn parse_html(url: &str, html: &str, char_budget: usize) -> WebPage {
    let base = reqwest::Url::parse(url).ok();

    let title = TITLE
        .as_ref()
        .and_then(|re| re.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| collapse(&decode_entities(m.as_str())))
        .unwrap_or_default();

    let visible = INVISIBLE
        .as_ref()
        .map_or_else(|| html.to_string(), |re| re.replace_all(html, " ").into_owned());

    let mut links: Vec<String> = Vec::new();
    if let Some(re) = HREF.as_ref() {
        for capture in re.captures_iter(&visible) {
            let Some(href) = capture.get(1).map(|m| decode_entities(m.as_str().trim())) else {
                continue;
            };
            let absolute = match &base {
                Some(base) => base.join(&href).ok(),
                None => reqwest::Url::parse(&href).ok(),
            };
            if let Some(link) = absolute
                && matches!(link.scheme(), "http" | "https")
            {
                let link = link.to_string();
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
    }

    let stripped = TAG
        .as_ref()
        .map_or_else(|| visible.clone(), |re| re.replace_all(&visible, " ").into_owned());
    let text: String = collapse(&decode_entities(&stripped))
        .chars()
        .take(char_budget)
        .collect();

    WebPage {
        url: url.to_string(),
        title,
        text,
        links,
    }
}

fn collapse(text: &str) -> String {
    SPACE
        .as_ref()
        .map_or_else(|| text.to_string(), |re| re.replace_all(text, " ").into_owned())
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><head><title> Acme &amp; Co </title>
        <style>body { color: red }</style></head>
        <body><h1>About</h1><script>var x = "<a href='/hidden'>";</script>
        <p>Acme was founded in 1999.</p>
        <a href="/team">Team</a> <a href="https://other.org/x">Other</a>
        <a href="/team">Team again</a> <a href="mailto:hi@acme.com">Mail</a>
        <a href="#top">Top</a></body></html>"##;

    #[test]
    fn test_parse_html_title_and_text() {
        let page = parse_html("https://acme.com/about", PAGE, 1000);
        assert_eq!(page.title, "Acme & Co");
        assert!(page.text.contains("Acme was founded in 1999."));
        assert!(!page.text.contains("color: red"));
        assert!(!page.text.contains("var x"));
    }

    #[test]
    fn test_parse_html_links_are_absolute_and_unique() {
        let page = parse_html("https://acme.com/about", PAGE, 1000);
        assert_eq!(
            page.links,
            vec!["https://acme.com/team".to_string(), "https://other.org/x".to_string()]
        );
    }

    #[test]
    fn test_parse_html_truncates_text() {
        let page = parse_html("https://acme.com", "<p>abcdefghij</p>", 4);
        assert_eq!(page.text, "abcd");
    }

    #[test]
    fn test_search_body_aliases() {
        let body: SearchBody = serde_json::from_str(
            r#"{"results": [{"url": "https://a.com", "content": "snippet a"},
                            {"url": "https://b.com", "title": "B", "snippet": "snippet b"}]}"#,
        )
        .unwrap_or_else(|_| unreachable!());
        let SearchBody::Wrapped { results } = body else {
            unreachable!()
        };
        assert_eq!(results[0].summary, "snippet a");
        assert_eq!(results[1].title, "B");
        assert_eq!(results[1].summary, "snippet b");

        let bare: SearchBody = serde_json::from_str(r#"[{"url": "https://c.com"}]"#)
            .unwrap_or_else(|_| unreachable!());
        assert!(matches!(bare, SearchBody::Bare(ref hits) if hits.len() == 1));
    }

    #[test]
    fn test_map_status() {
        let err = map_status("web_fetch", "u", reqwest::StatusCode::NOT_FOUND);
        assert!(matches!(err, ServiceError::NotFound { .. }));
        let err = map_status("web_fetch", "u", reqwest::StatusCode::BAD_GATEWAY);
        assert!(err.is_transient());
        let err = map_status("web_fetch", "u", reqwest::StatusCode::FORBIDDEN);
        assert!(!err.is_transient());
    }
}
