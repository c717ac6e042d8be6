use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

pub const DEFAULT_MAX_RESULTS: usize = 5;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 3_000;
/// Hard cap on bytes read from a fetched body before extraction.
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024;
pub const DEFAULT_SESSION_WINDOW: usize = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),
    #[error("fetch timed out: {0}")]
    Timeout(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Errors the research loop must hand back to its caller instead of degrading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::GenerationUnavailable(_)
                | Error::NotConfigured(_)
                | Error::Cancelled
                | Error::InvalidInput(_)
        )
    }

    /// Stable snake_case identifier for JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::SearchUnavailable(_) => "search_unavailable",
            Error::Timeout(_) => "timeout",
            Error::FetchFailed(_) => "fetch_failed",
            Error::GenerationUnavailable(_) => "generation_unavailable",
            Error::NotConfigured(_) => "not_configured",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parse and check a fetchable URL: absolute, `http`/`https`, with a host.
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidInput("url is empty".to_string()));
    }
    let url = url::Url::parse(raw).map_err(|e| Error::InvalidInput(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidInput(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, |h| h.is_empty()) {
        return Err(Error::InvalidInput(format!("{raw}: missing host")));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    /// Backend region hint (e.g. `jp-jp`, `wt-wt`).
    pub region: Option<String>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Result<Self> {
        let q = Self {
            query: query.into(),
            max_results,
            region: None,
        };
        q.validate()?;
        Ok(q)
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::InvalidInput("search query is empty".to_string()));
        }
        Ok(())
    }
}

/// One entry from a web search listing. Missing backend fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub provider: String,
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Deadline for the whole transaction (connect + headers + body).
    pub timeout_ms: u64,
    /// Hard cap on characters of extracted text returned.
    pub max_content_chars: usize,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let req = Self {
            url: url.into(),
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_bytes: Some(DEFAULT_MAX_BYTES),
        };
        req.validate()?;
        Ok(req)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_content_chars(mut self, max_content_chars: usize) -> Self {
        self.max_content_chars = max_content_chars;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<url::Url> {
        if self.timeout_ms == 0 {
            return Err(Error::InvalidInput("timeout must be positive".to_string()));
        }
        validate_url(&self.url)
    }
}

/// Why a fetch produced no content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    Timeout { message: String },
    Failed { message: String },
}

impl FetchFailure {
    pub fn message(&self) -> &str {
        match self {
            FetchFailure::Timeout { message } | FetchFailure::Failed { message } => message,
        }
    }

    pub fn to_error(&self) -> Error {
        match self {
            FetchFailure::Timeout { message } => Error::Timeout(message.clone()),
            FetchFailure::Failed { message } => Error::FetchFailed(message.clone()),
        }
    }
}

/// Extracted, truncated plain text of one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    /// 200 on success, 500 on timeout/internal failure, otherwise the upstream status.
    pub status: u16,
    pub title: String,
    pub content: String,
    /// Reserved for pagination; always false.
    pub has_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FetchFailure>,
}

impl FetchedPage {
    pub fn success(url: impl Into<String>, title: String, content: String) -> Self {
        Self {
            url: url.into(),
            status: 200,
            title,
            content,
            has_next: false,
            failure: None,
        }
    }

    pub fn timed_out(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 500,
            title: String::new(),
            content: String::new(),
            has_next: false,
            failure: Some(FetchFailure::Timeout {
                message: message.into(),
            }),
        }
    }

    pub fn failed(url: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            title: String::new(),
            content: String::new(),
            has_next: false,
            failure: Some(FetchFailure::Failed {
                message: message.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.status == 200
    }
}

#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    /// Only `Error::InvalidInput` is returned as `Err`; every other outcome is a page.
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchedPage>;
}

/// Answer generation backend (LLM). Failures map to `Error::GenerationUnavailable`.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;
    /// Model identifier sent to the backend; empty when the backend has none.
    fn model(&self) -> &str {
        ""
    }
    async fn generate(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// URLs whose content was given to the generator, in search-rank order.
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// Caller-owned conversation context. Keeps the last `window` turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    window: usize,
    turns: VecDeque<Turn>,
}

impl Default for ResearchSession {
    fn default() -> Self {
        Self::with_window(DEFAULT_SESSION_WINDOW)
    }
}

impl ResearchSession {
    pub fn with_window(window: usize) -> Self {
        Self {
            window,
            turns: VecDeque::new(),
        }
    }

    pub fn push(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        if self.window == 0 {
            return;
        }
        while self.turns.len() >= self.window {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            question: question.into(),
            answer: answer.into(),
        });
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Loop states in the order they are entered; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchState {
    Start,
    Search,
    Fetch,
    Synthesize,
    Done,
}

/// Emitted by the research loop at each step; a UI subscribes to these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResearchEvent {
    Started {
        question: String,
    },
    QueryPlanned {
        query: String,
    },
    SearchAttemptFailed {
        attempt: u32,
        message: String,
    },
    SearchCompleted {
        query: String,
        results: Vec<SearchResult>,
    },
    FetchStarted {
        url: String,
    },
    FetchCompleted {
        url: String,
        title: String,
        chars: usize,
    },
    FetchSkipped {
        url: String,
        status: u16,
        reason: String,
    },
    Synthesizing {
        sources: Vec<String>,
    },
    Finished {
        sources: Vec<String>,
    },
}

impl ResearchEvent {
    pub fn state(&self) -> ResearchState {
        match self {
            ResearchEvent::Started { .. } => ResearchState::Start,
            ResearchEvent::QueryPlanned { .. }
            | ResearchEvent::SearchAttemptFailed { .. }
            | ResearchEvent::SearchCompleted { .. } => ResearchState::Search,
            ResearchEvent::FetchStarted { .. }
            | ResearchEvent::FetchCompleted { .. }
            | ResearchEvent::FetchSkipped { .. } => ResearchState::Fetch,
            ResearchEvent::Synthesizing { .. } => ResearchState::Synthesize,
            ResearchEvent::Finished { .. } => ResearchState::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_rejects_relative_and_non_http() {
        assert!(validate_url("https://example.com/a?b=c").is_ok());
        assert!(matches!(validate_url(""), Err(Error::InvalidInput(_))));
        assert!(matches!(validate_url("/relative/path"), Err(Error::InvalidInput(_))));
        assert!(matches!(validate_url("ftp://example.com/"), Err(Error::InvalidInput(_))));
        assert!(matches!(validate_url("mailto:a@b.c"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn search_query_rejects_blank() {
        assert!(SearchQuery::new("capital of Japan", 5).is_ok());
        assert!(matches!(SearchQuery::new("   ", 5), Err(Error::InvalidInput(_))));
        // Zero is a valid boundary; providers answer it with an empty listing.
        assert!(SearchQuery::new("x", 0).is_ok());
    }

    #[test]
    fn fetch_request_rejects_zero_timeout() {
        let req = FetchRequest::new("https://example.com").unwrap().with_timeout_ms(0);
        assert!(matches!(req.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn failed_pages_are_empty_and_tagged() {
        let p = FetchedPage::timed_out("https://x.test/", "deadline");
        assert_eq!(p.status, 500);
        assert!(p.content.is_empty() && p.title.is_empty());
        assert!(!p.has_next);
        assert_eq!(p.failure.as_ref().unwrap().to_error(), Error::Timeout("deadline".into()));

        let p = FetchedPage::failed("https://x.test/", 404, "HTTP 404");
        assert_eq!(p.status, 404);
        assert!(!p.is_success());
    }

    #[test]
    fn session_keeps_only_the_window() {
        let mut s = ResearchSession::with_window(2);
        s.push("q1", "a1");
        s.push("q2", "a2");
        s.push("q3", "a3");
        let qs: Vec<_> = s.turns().map(|t| t.question.as_str()).collect();
        assert_eq!(qs, vec!["q2", "q3"]);

        assert_eq!(s.len(), 2);
        s.clear();
        assert!(s.is_empty());
        s.push("q4", "a4");
        assert_eq!(s.len(), 1);

        let mut off = ResearchSession::with_window(0);
        off.push("q", "a");
        assert!(off.is_empty());
    }

    #[test]
    fn events_serialize_with_tag_and_map_to_states() {
        let ev = ResearchEvent::FetchSkipped {
            url: "https://x.test/".into(),
            status: 500,
            reason: "timeout".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "fetch_skipped");
        assert_eq!(v["status"], 500);
        assert_eq!(ev.state(), ResearchState::Fetch);
        assert_eq!(
            ResearchEvent::Finished { sources: vec![] }.state(),
            ResearchState::Done
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::GenerationUnavailable("down".into()).is_fatal());
        assert!(Error::Cancelled.is_fatal());
        assert!(!Error::SearchUnavailable("x".into()).is_fatal());
        assert!(!Error::Timeout("x".into()).is_fatal());
        assert!(!Error::FetchFailed("x".into()).is_fatal());
        assert_eq!(Error::Timeout("x".into()).code(), "timeout");
    }
}
