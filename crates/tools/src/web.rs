//! Web search, news search, and guarded page fetching.
//!
//! `fetch_page` only follows URLs the agent has already "seen" — ones that
//! appeared in user text or came back from a search.  The allow-list is
//! in-memory only; a restart empties it and pages must be re-discovered.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{Tool, ToolOutput, ToolSpec, schema_for};

const WEB_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_CHARS: usize = 20_000;
const DEFAULT_RESULTS: usize = 5;

// ── URL allow-list ───────────────────────────────────────────────────────────

/// Set of URLs that entered the conversation via user text or a search
/// result.  Only these are fetchable.
#[derive(Clone, Default)]
pub struct UrlAllowList {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl UrlAllowList {
    pub fn allow(&self, url: &str) {
        self.inner.lock().unwrap().insert(url.to_string());
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner.lock().unwrap().contains(url)
    }

    /// Pull `http(s)` URLs out of free text (a user message) and allow them.
    /// Returns how many were found.
    pub fn allow_from_text(&self, text: &str) -> usize {
        static URL_PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        let pattern = URL_PATTERN
            .get_or_init(|| regex::Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static regex"));
        let mut found = 0;
        for m in pattern.find_iter(text) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
            self.allow(url);
            found += 1;
        }
        found
    }
}

// ── Brave search client ──────────────────────────────────────────────────────

async fn brave_search(
    endpoint: &str,
    api_key: &str,
    query: &str,
    count: usize,
    allow_list: &UrlAllowList,
) -> Result<Vec<String>> {
    let client = reqwest::Client::builder().timeout(WEB_TIMEOUT).build()?;
    let response = client
        .get(endpoint)
        .query(&[("q", query), ("count", &count.to_string())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Brave Search API error {status}: {body}");
    }

    let json: Value = response.json().await?;
    let results = json["web"]["results"]
        .as_array()
        .or_else(|| json["results"].as_array())
        .cloned()
        .unwrap_or_default();

    let mut lines = Vec::new();
    for item in results.iter().take(count) {
        let title = item["title"].as_str().unwrap_or("").trim();
        let url = item["url"].as_str().unwrap_or("").trim();
        let desc = item["description"].as_str().unwrap_or("").trim();
        if title.is_empty() || url.is_empty() {
            continue;
        }
        // Every returned URL becomes fetchable.
        allow_list.allow(url);
        lines.push(format!("{title}\n  {url}\n  {desc}"));
    }
    Ok(lines)
}

// ── web_search ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct WebSearchArgs {
    query: String,
    /// Maximum results (default 5).
    max_results: Option<usize>,
}

pub struct WebSearchTool {
    pub api_key: Option<String>,
    pub allow_list: UrlAllowList,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web. Result URLs become fetchable with fetch_page.".to_string(),
            input_schema: schema_for::<WebSearchArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: WebSearchArgs = serde_json::from_value(args.clone())?;
        let Some(key) = self.api_key.as_deref() else {
            return Ok(ToolOutput::error(
                "web_search is not configured (missing search API key)",
            ));
        };

        let lines = brave_search(
            "https://api.search.brave.com/res/v1/web/search",
            key,
            &args.query,
            args.max_results.unwrap_or(DEFAULT_RESULTS),
            &self.allow_list,
        )
        .await?;

        if lines.is_empty() {
            Ok(ToolOutput::text("No results."))
        } else {
            Ok(ToolOutput::text(lines.join("\n\n")))
        }
    }
}

// ── news_search ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct NewsSearchArgs {
    query: String,
    max_results: Option<usize>,
}

pub struct NewsSearchTool {
    pub api_key: Option<String>,
    pub allow_list: UrlAllowList,
}

#[async_trait]
impl Tool for NewsSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "news_search".to_string(),
            description: "Search recent news. Result URLs become fetchable with fetch_page.".to_string(),
            input_schema: schema_for::<NewsSearchArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: NewsSearchArgs = serde_json::from_value(args.clone())?;
        let Some(key) = self.api_key.as_deref() else {
            return Ok(ToolOutput::error(
                "news_search is not configured (missing search API key)",
            ));
        };

        let lines = brave_search(
            "https://api.search.brave.com/res/v1/news/search",
            key,
            &args.query,
            args.max_results.unwrap_or(DEFAULT_RESULTS),
            &self.allow_list,
        )
        .await?;

        if lines.is_empty() {
            Ok(ToolOutput::text("No results."))
        } else {
            Ok(ToolOutput::text(lines.join("\n\n")))
        }
    }
}

// ── fetch_page ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct FetchPageArgs {
    /// URL to fetch. Must have appeared in user text or a search result.
    url: String,
    /// Best-effort hint for JavaScript-heavy pages; plain fetch is used when
    /// no rendering backend is configured.
    #[allow(dead_code)]
    wait_for_js: Option<bool>,
}

pub struct FetchPageTool {
    pub allow_list: UrlAllowList,
}

#[async_trait]
impl Tool for FetchPageTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_page".to_string(),
            description: "Fetch a previously-seen URL and return its readable text.".to_string(),
            input_schema: schema_for::<FetchPageArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: FetchPageArgs = serde_json::from_value(args.clone())?;

        if !self.allow_list.contains(&args.url) {
            // No HTTP call is made for unknown URLs.
            return Ok(ToolOutput::text(format!(
                "BLOCKED: URL {} not in allowlist.",
                args.url
            )));
        }

        let client = reqwest::Client::builder().timeout(WEB_TIMEOUT).build()?;
        let response = client.get(&args.url).send().await?.error_for_status()?;
        let html = response.text().await?;
        let text = extract_readable_text(&html);
        debug!(url = %args.url, chars = text.len(), "fetched page");

        if text.trim().is_empty() {
            Ok(ToolOutput::text("(page contained no readable text)"))
        } else {
            Ok(ToolOutput::text(truncate_chars(&text, MAX_PAGE_CHARS)))
        }
    }
}

/// Extract readable text from HTML, targeting article/main regions before
/// falling back to the whole body.
fn extract_readable_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);

    let focused = ["article", "main", "[role=\"main\"]"];
    for raw in &focused {
        if let Ok(selector) = scraper::Selector::parse(raw) {
            if let Some(element) = document.select(&selector).next() {
                let text: String = element.text().collect();
                let text = collapse_whitespace(&text);
                if text.len() >= 80 {
                    return text;
                }
            }
        }
    }

    if let Ok(selector) = scraper::Selector::parse("body") {
        if let Some(body) = document.select(&selector).next() {
            let raw: String = body.text().collect();
            return collapse_whitespace(&raw);
        }
    }
    String::new()
}

/// Collapse runs of whitespace into single spaces and trim.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cap page text at `max_chars` characters, slicing at the byte offset of
/// the first excess character.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_extracts_urls_from_text() {
        let allow = UrlAllowList::default();
        let found = allow.allow_from_text(
            "see https://example.com/a and (https://example.org/b), nothing else",
        );
        assert_eq!(found, 2);
        assert!(allow.contains("https://example.com/a"));
        assert!(allow.contains("https://example.org/b"));
        assert!(!allow.contains("https://evil.example/"));
    }

    #[test]
    fn trailing_punctuation_is_stripped() {
        let allow = UrlAllowList::default();
        allow.allow_from_text("read https://example.com/page.");
        assert!(allow.contains("https://example.com/page"));
    }

    #[tokio::test]
    async fn fetch_page_blocks_unknown_urls_without_a_request() {
        let tool = FetchPageTool {
            allow_list: UrlAllowList::default(),
        };
        let output = tool
            .run(&serde_json::json!({ "url": "https://evil.example/" }))
            .await
            .unwrap();
        assert_eq!(
            output.joined_text(),
            "BLOCKED: URL https://evil.example/ not in allowlist."
        );
        assert!(!output.is_error);
    }

    #[test]
    fn readable_text_prefers_article_over_chrome() {
        let html = "<html><body><nav>menu menu menu</nav><article><p>The actual story, \
                    long enough to pass the focused-region length floor, keeps going \
                    with more words here.</p></article></body></html>";
        let text = extract_readable_text(html);
        assert!(text.contains("actual story"));
        assert!(!text.contains("menu menu"));
    }

    #[test]
    fn collapse_whitespace_flattens_runs() {
        assert_eq!(collapse_whitespace("  hello \n\t world  "), "hello world");
    }
}
