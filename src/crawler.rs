//! Page fetching for tag and summary generation
//!
//! The fetcher pulls the page title, the `<meta name="description">` text and
//! a slice of the main text so the model sees more than the bookmark title.
//! A failed fetch is not fatal: the reason travels into the prompt instead.

use crate::error::{Error, Result};
use crate::util::{one_line, truncate, truncate_chars};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Body text kept per page when no `<main>`/`<article>` element exists.
pub const MAX_BODY_CHARS: usize = 5000;

/// Page text forwarded to the model.
pub const PROMPT_CONTENT_CHARS: usize = 2000;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// What could be read from a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebContent {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
}

/// Result of trying to read a bookmark's page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Fetched(WebContent),
    /// The page could not be read; holds a readable reason.
    Failed(String),
}

impl PageLookup {
    pub fn content(&self) -> Option<&WebContent> {
        match self {
            PageLookup::Fetched(page) => Some(page),
            PageLookup::Failed(_) => None,
        }
    }
}

/// HTTP GET of bookmarked pages with a short timeout.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    http: reqwest::Client,
    timeout_secs: u64,
}

impl PageFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout_secs(DEFAULT_FETCH_TIMEOUT_SECS)
    }

    pub fn with_timeout_secs(timeout_secs: u64) -> Result<Self> {
        let timeout_secs = timeout_secs.max(1);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Configuration(format!("could not build HTTP client: {}", e)))?;
        Ok(Self { http, timeout_secs })
    }

    /// Fetch and extract `url`.
    pub async fn fetch(&self, url: &str) -> Result<WebContent> {
        let parsed = url::Url::parse(url.trim())
            .map_err(|e| Error::request(None, format!("invalid page url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::request(
                None,
                format!("unsupported page url scheme: {}", parsed.scheme()),
            ));
        }

        let response = self
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::request(
                Some(status.as_u16()),
                format!("failed to fetch page: {}", status),
            ));
        }
        let html = response.text().await.map_err(|e| self.transport_error(e))?;
        Ok(extract(url, &html))
    }

    /// Fetch `url`, folding any failure into `PageLookup::Failed`.
    pub async fn lookup(&self, url: &str) -> PageLookup {
        match self.fetch(url).await {
            Ok(page) => PageLookup::Fetched(page),
            Err(err) => {
                tracing::warn!(url, error = %err, "could not fetch page content");
                PageLookup::Failed(page_failure_reason(&err))
            }
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                secs: self.timeout_secs,
            }
        } else if err.is_connect() {
            Error::request(None, "could not connect to the site")
        } else {
            Error::request(None, one_line(&err.to_string()))
        }
    }
}

fn page_failure_reason(err: &Error) -> String {
    match err {
        Error::Timeout { secs } => format!("the site did not respond within {}s", secs),
        Error::Request { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Pull title, meta description and main text out of an HTML document.
pub fn extract(url: &str, html: &str) -> WebContent {
    let title = first_capture(title_re(), html)
        .map(|t| clean_text(&t))
        .unwrap_or_default();
    let description = meta_description(html).unwrap_or_default();

    let stripped = match noise_re() {
        Some(re) => re.replace_all(html, " ").into_owned(),
        None => html.to_string(),
    };
    let content = match first_capture(main_re(), &stripped)
        .or_else(|| first_capture(article_re(), &stripped))
    {
        Some(main) => clean_text(&main),
        None => {
            let body = first_capture(body_re(), &stripped).unwrap_or(stripped);
            truncate(&clean_text(&body), MAX_BODY_CHARS)
        }
    };

    WebContent {
        url: url.to_string(),
        title,
        description,
        content,
    }
}

/// Page text cut to what the prompt carries.
pub fn prompt_excerpt(page: &WebContent) -> &str {
    truncate_chars(page.content.trim(), PROMPT_CONTENT_CHARS)
}

fn meta_description(html: &str) -> Option<String> {
    meta_tag_re()?
        .find_iter(html)
        .map(|m| m.as_str())
        .filter(|tag| meta_name_re().is_some_and(|re| re.is_match(tag)))
        .find_map(|tag| {
            let caps = meta_content_re()?.captures(tag)?;
            caps.get(1).or_else(|| caps.get(2)).map(|m| clean_text(m.as_str()))
        })
}

fn first_capture(re: Option<&'static Regex>, text: &str) -> Option<String> {
    re?.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn clean_text(fragment: &str) -> String {
    let text = match tag_re() {
        Some(re) => re.replace_all(fragment, " ").into_owned(),
        None => fragment.to_string(),
    };
    one_line(&decode_entities(&text))
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let Some(re) = entity_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures| {
        let entity = &caps[1];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
    .into_owned()
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn title_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<title\b[^>]*>(.*?)</title>")
}

fn meta_tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<meta\b[^>]*>")
}

fn meta_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?i)\bname\s*=\s*["']?description["'\s/>]"#)
}

fn meta_content_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?is)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
}

fn noise_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &RE,
        r"(?is)<!--.*?-->|<script\b.*?</script>|<style\b.*?</style>|<iframe\b.*?</iframe>|<nav\b.*?</nav>|<footer\b.*?</footer>|<header\b.*?</header>|<head\b.*?</head>",
    )
}

fn main_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<main\b[^>]*>(.*?)</main>")
}

fn article_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<article\b[^>]*>(.*?)</article>")
}

fn body_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<body\b[^>]*>(.*)</body>")
}

fn tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)<[^>]*>")
}

fn entity_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,6});")
}
