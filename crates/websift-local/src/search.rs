use crate::env;
use html_scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use websift_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};

pub const DEFAULT_DDG_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
pub const DEFAULT_REGION: &str = "wt-wt";
/// DuckDuckGo `kp` value: -2 disables safe search.
pub const DEFAULT_SAFE_SEARCH: &str = "-2";

fn search_timeout_from_env() -> Duration {
    // Provider requests can hang without an explicit deadline; keep a sane range.
    let ms = env("WEBSIFT_SEARCH_TIMEOUT_MS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(15_000)
        .clamp(500, 60_000);
    Duration::from_millis(ms)
}

fn searxng_endpoint_from_env() -> Option<String> {
    env("WEBSIFT_SEARXNG_ENDPOINT")
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// DuckDuckGo wraps result links as `//duckduckgo.com/l/?uddg=<encoded>&rut=...`.
fn unwrap_redirect(href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    let abs = if href.starts_with("//") {
        format!("https:{href}")
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{href}")
    } else {
        href.to_string()
    };
    if let Ok(u) = url::Url::parse(&abs) {
        if u.path().starts_with("/l/") {
            if let Some((_, target)) = u.query_pairs().find(|(k, _)| k == "uddg") {
                return target.into_owned();
            }
        }
    }
    abs
}

fn is_sponsored(el: &ElementRef) -> bool {
    el.value()
        .attr("class")
        .map(|c| {
            c.split_whitespace()
                .any(|t| t == "result--ad" || t == "result-sponsored")
        })
        .unwrap_or(false)
}

/// Parse a DuckDuckGo result page. Understands both the `html` and `lite` layouts.
///
/// Missing titles/snippets/links become empty strings rather than errors.
pub fn parse_duckduckgo_html(body: &str, max_results: usize) -> Vec<SearchResult> {
    if max_results == 0 {
        return Vec::new();
    }
    let doc = Html::parse_document(body);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for result in doc.select(&result_sel) {
        if out.len() >= max_results {
            break;
        }
        if is_sponsored(&result) {
            continue;
        }
        let link = result.select(&link_sel).next();
        // Containers like `.result--no-result` have neither a link nor a snippet.
        let snippet = result.select(&snippet_sel).next();
        if link.is_none() && snippet.is_none() {
            continue;
        }
        out.push(SearchResult {
            title: link.as_ref().map(element_text).unwrap_or_default(),
            snippet: snippet.as_ref().map(element_text).unwrap_or_default(),
            url: link
                .and_then(|a| a.value().attr("href"))
                .map(unwrap_redirect)
                .unwrap_or_default(),
        });
    }
    if !out.is_empty() {
        return out;
    }

    // Lite layout: link rows and snippet rows interleaved in one table. A snippet belongs to
    // the nearest link before it; a link with no snippet row keeps an empty snippet.
    let Ok(lite_rows) = Selector::parse("a.result-link, td.result-snippet") else {
        return out;
    };
    let mut rows: Vec<(SearchResult, bool)> = Vec::new();
    for el in doc.select(&lite_rows) {
        if el.value().name() == "a" {
            let sponsored = el
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|p| is_sponsored(&p));
            let hit = SearchResult {
                title: element_text(&el),
                snippet: String::new(),
                url: el.value().attr("href").map(unwrap_redirect).unwrap_or_default(),
            };
            rows.push((hit, sponsored));
        } else if let Some((last, _)) = rows.last_mut() {
            if last.snippet.is_empty() {
                last.snippet = element_text(&el);
            }
        }
    }
    out.extend(
        rows.into_iter()
            .filter(|(_, sponsored)| !sponsored)
            .map(|(hit, _)| hit)
            .take(max_results),
    );
    out
}

#[derive(Debug, Clone)]
pub struct DuckDuckGoSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    region: String,
    safe_search: String,
    timeout: Duration,
}

impl DuckDuckGoSearchProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: DEFAULT_DDG_ENDPOINT.to_string(),
            region: DEFAULT_REGION.to_string(),
            safe_search: DEFAULT_SAFE_SEARCH.to_string(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        let mut p = Self::new(client);
        if let Some(ep) = env("WEBSIFT_DDG_ENDPOINT") {
            p.endpoint = ep;
        }
        if let Some(region) = env("WEBSIFT_SEARCH_REGION") {
            p.region = region;
        }
        if let Some(kp) = env("WEBSIFT_SEARCH_SAFE") {
            p.safe_search = kp;
        }
        p.timeout = search_timeout_from_env();
        p
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoSearchProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        q.validate()?;
        let mut timings_ms = BTreeMap::new();
        if q.max_results == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                provider: self.name().to_string(),
                timings_ms,
            });
        }

        let t0 = Instant::now();
        let region = q.region.as_deref().unwrap_or(&self.region);
        tracing::debug!(query = %q.query, region, endpoint = %self.endpoint, "duckduckgo search");
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/html")
            .form(&[
                ("q", q.query.as_str()),
                ("kl", region),
                ("kp", self.safe_search.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::SearchUnavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::SearchUnavailable(format!(
                "duckduckgo search HTTP {status}"
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::SearchUnavailable(e.to_string()))?;

        // `Html` is !Send; parse fully before returning to the executor.
        let results = parse_duckduckgo_html(&body, q.max_results);
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results,
            provider: self.name().to_string(),
            timings_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearxngSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl SearxngSearchProvider {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoint = searxng_endpoint_from_env().ok_or_else(|| {
            Error::NotConfigured("missing WEBSIFT_SEARXNG_ENDPOINT".to_string())
        })?;
        Ok(Self {
            timeout: search_timeout_from_env(),
            ..Self::new(client, endpoint)
        })
    }

    fn endpoint_search(&self) -> String {
        // Accept either a base URL (…/), or a full /search endpoint.
        let mut base = self.endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    // SearXNG uses `content` for snippets in JSON format.
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SearxngSearchProvider {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        q.validate()?;
        let mut timings_ms = BTreeMap::new();
        if q.max_results == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                provider: self.name().to_string(),
                timings_ms,
            });
        }

        let t0 = Instant::now();
        let mut req = self
            .client
            .get(self.endpoint_search())
            .query(&[("q", q.query.as_str()), ("format", "json")]);
        if let Some(lang) = q.region.as_deref() {
            req = req.query(&[("language", lang)]);
        }
        let resp = req
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::SearchUnavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::SearchUnavailable(format!(
                "searxng search HTTP {status}"
            )));
        }
        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::SearchUnavailable(e.to_string()))?;

        let results = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .take(q.max_results)
            .map(|r| SearchResult {
                title: r.title.unwrap_or_default(),
                snippet: r.content.unwrap_or_default(),
                url: r.url.unwrap_or_default(),
            })
            .collect();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results,
            provider: self.name().to_string(),
            timings_ms,
        })
    }
}

/// Pick the search backend named by `WEBSIFT_SEARCH_PROVIDER` (default: duckduckgo).
pub fn search_provider_from_env(client: reqwest::Client) -> Result<Arc<dyn SearchProvider>> {
    let name = env("WEBSIFT_SEARCH_PROVIDER").unwrap_or_else(|| "duckduckgo".to_string());
    match name.to_ascii_lowercase().as_str() {
        "duckduckgo" | "ddg" => Ok(Arc::new(DuckDuckGoSearchProvider::from_env(client))),
        "searxng" => Ok(Arc::new(SearxngSearchProvider::from_env(client)?)),
        other => Err(Error::NotConfigured(format!(
            "unknown WEBSIFT_SEARCH_PROVIDER: {other} (allowed: duckduckgo, searxng)"
        ))),
    }
}
