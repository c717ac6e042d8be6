//! Search → fetch top-K → synthesize.
//!
//! The loop is linear (`Start → Search → Fetch → Synthesize → Done`). Search outages and
//! individual fetch failures degrade the answer; generation outages and cancellation are
//! returned to the caller.

use crate::config::ResearchConfig;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use websift_core::{
    validate_url, Answer, Error, FetchRequest, FetchedPage, Generator, PageFetcher,
    ResearchEvent, ResearchSession, Result, SearchProvider, SearchQuery, SearchResult,
};

pub const SYSTEM_PROMPT: &str = "\
Your role is to answer the user's question using the web pages provided below.
Rules you must follow:
- Answer as briefly as possible, as a summary.
- If the answer gets long, break it into lines so it is easy to read.
- Use only the information in the provided sources; say so if they do not answer the question.
- After the answer, on a new line, list the URLs of the pages you referred to.";

pub const PLANNER_PROMPT: &str = "\
Rewrite the user's question as a short web search query made of keywords.
Reply with the query only, on one line, without quotes or explanations.";

pub const NO_DATA_ANSWER: &str = "\
No information was found for this question: the web search returned no pages that could be \
read, so no sources were consulted.";

// Backstop for fetchers that ignore their own deadline; extraction runs after the download.
const FETCH_DEADLINE_GRACE: Duration = Duration::from_secs(2);
const MAX_PLANNED_QUERY_CHARS: usize = 200;

pub struct ResearchLoop {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    generator: Arc<dyn Generator>,
    config: ResearchConfig,
    events: Option<UnboundedSender<ResearchEvent>>,
}

/// First K distinct, fetchable URLs in rank order.
pub fn select_urls(results: &[SearchResult], top_k: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| validate_url(&r.url).is_ok())
        .filter(|r| seen.insert(r.url.trim().to_string()))
        .take(top_k)
        .map(|r| r.url.trim().to_string())
        .collect()
}

/// First non-empty line of a planner reply, unquoted and bounded.
fn clean_planned_query(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(|c: char| c == '"' || c == '\'' || c == '`');
    let line = line
        .strip_prefix("Query:")
        .or_else(|| line.strip_prefix("query:"))
        .unwrap_or(line)
        .trim();
    let q: String = line.chars().take(MAX_PLANNED_QUERY_CHARS).collect();
    (!q.trim().is_empty()).then_some(q)
}

fn synthesis_prompt(question: &str, session: &ResearchSession, pages: &[&FetchedPage]) -> String {
    let mut out = String::new();
    if !session.is_empty() {
        out.push_str("Previous conversation:\n");
        for t in session.turns() {
            out.push_str("Q: ");
            out.push_str(&t.question);
            out.push_str("\nA: ");
            out.push_str(&t.answer);
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str("Question: ");
    out.push_str(question);
    out.push_str("\n\nSources:\n");
    for (i, p) in pages.iter().enumerate() {
        out.push_str(&format!("\n[{}] {}\nURL: {}\n{}\n", i + 1, p.title, p.url, p.content));
    }
    out
}

impl ResearchLoop {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            search,
            fetcher,
            generator,
            config: ResearchConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: ResearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to step events. Send failures (dropped receiver) are ignored.
    pub fn with_events(mut self, tx: UnboundedSender<ResearchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    fn emit(&self, ev: ResearchEvent) {
        tracing::debug!(state = ?ev.state(), event = ?ev, "research event");
        if let Some(tx) = &self.events {
            let _ = tx.send(ev);
        }
    }

    /// The search tool: up to `max_results` results in backend rank order.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let q = SearchQuery::new(query, max_results)?.with_region(self.config.region.clone());
        Ok(self.search.search(&q).await?.results)
    }

    /// The fetch tool: never fails except on malformed input.
    ///
    /// `timeout` is rounded up to whole milliseconds, with a 1 ms floor.
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        max_content_chars: usize,
    ) -> Result<FetchedPage> {
        let timeout_ms = timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .clamp(1, u64::MAX as u128) as u64;
        let req = FetchRequest::new(url)?
            .with_timeout_ms(timeout_ms)
            .with_max_content_chars(max_content_chars);
        self.fetcher.fetch(&req).await
    }

    /// One-shot answer with no prior conversation.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let mut session = ResearchSession::with_window(0);
        self.answer_in(&mut session, question).await
    }

    /// Answer within a caller-owned session; the turn is recorded only on success.
    pub async fn answer_in(&self, session: &mut ResearchSession, question: &str) -> Result<Answer> {
        self.answer_with_cancel(session, question, &CancellationToken::new())
            .await
    }

    /// Like `answer_in`, aborting all in-flight requests once `cancel` fires.
    pub async fn answer_with_cancel(
        &self,
        session: &mut ResearchSession,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let outcome = {
            let history: &ResearchSession = session;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = self.run(history, question) => r,
            }
        };
        match &outcome {
            Ok(answer) => session.push(question.trim(), answer.text.clone()),
            Err(e) => tracing::warn!(error = %e, "research aborted"),
        }
        outcome
    }

    async fn run(&self, session: &ResearchSession, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::InvalidInput("question is empty".to_string()));
        }
        self.emit(ResearchEvent::Started {
            question: question.to_string(),
        });
        let mut warnings = Vec::new();

        let query = self.derive_query(question).await?;
        let results = self.search_with_retry(&query, &mut warnings).await?;
        self.emit(ResearchEvent::SearchCompleted {
            query: query.clone(),
            results: results.clone(),
        });

        let urls = select_urls(&results, self.config.top_k);
        let pages = self.fetch_all(&urls).await;
        let mut used: Vec<&FetchedPage> = Vec::new();
        for url in &urls {
            let Some(page) = pages.get(url) else { continue };
            let reason = match &page.failure {
                Some(f) => Some(f.message().to_string()),
                None if page.content.trim().is_empty() => Some("no readable content".to_string()),
                None => None,
            };
            match reason {
                None => {
                    self.emit(ResearchEvent::FetchCompleted {
                        url: url.clone(),
                        title: page.title.clone(),
                        chars: page.content.chars().count(),
                    });
                    used.push(page);
                }
                Some(reason) => {
                    warnings.push(format!("skipped {url}: {reason}"));
                    self.emit(ResearchEvent::FetchSkipped {
                        url: url.clone(),
                        status: page.status,
                        reason,
                    });
                }
            }
        }

        if used.is_empty() {
            tracing::info!(question, "no usable sources; answering without generation");
            self.emit(ResearchEvent::Finished { sources: vec![] });
            return Ok(Answer {
                text: NO_DATA_ANSWER.to_string(),
                sources: vec![],
                warnings,
            });
        }

        let sources: Vec<String> = used.iter().map(|p| p.url.clone()).collect();
        self.emit(ResearchEvent::Synthesizing {
            sources: sources.clone(),
        });
        let prompt = synthesis_prompt(question, session, &used);
        let text = self.generator.generate(SYSTEM_PROMPT, &prompt).await?;
        self.emit(ResearchEvent::Finished {
            sources: sources.clone(),
        });
        Ok(Answer {
            text,
            sources,
            warnings,
        })
    }

    async fn derive_query(&self, question: &str) -> Result<String> {
        if !self.config.plan_queries {
            return Ok(question.to_string());
        }
        let reply = self.generator.generate(PLANNER_PROMPT, question).await?;
        let query = clean_planned_query(&reply).unwrap_or_else(|| question.to_string());
        self.emit(ResearchEvent::QueryPlanned {
            query: query.clone(),
        });
        Ok(query)
    }

    /// At most `1 + search_retries` attempts; a lasting outage becomes an empty listing.
    async fn search_with_retry(
        &self,
        query: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<SearchResult>> {
        let attempts = 1 + self.config.search_retries.min(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.search(query, self.config.max_results).await {
                Ok(results) => return Ok(results),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "search attempt failed");
                    self.emit(ResearchEvent::SearchAttemptFailed {
                        attempt,
                        message: e.to_string(),
                    });
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            warnings.push(format!("search returned no results: {e}"));
        }
        Ok(Vec::new())
    }

    /// Fan-out/fan-in: every URL fetched concurrently, each under its own deadline.
    async fn fetch_all(&self, urls: &[String]) -> HashMap<String, FetchedPage> {
        let tasks = urls.iter().map(|url| async move {
            self.emit(ResearchEvent::FetchStarted { url: url.clone() });
            let page = match FetchRequest::new(url.clone()) {
                Err(e) => FetchedPage::failed(url.clone(), 500, e.to_string()),
                Ok(req) => {
                    let req = req
                        .with_timeout_ms(self.config.fetch_timeout_ms)
                        .with_max_content_chars(self.config.max_content_chars);
                    let deadline = req.timeout() + FETCH_DEADLINE_GRACE;
                    match tokio::time::timeout(deadline, self.fetcher.fetch(&req)).await {
                        Ok(Ok(page)) => page,
                        Ok(Err(e)) => FetchedPage::failed(url.clone(), 500, e.to_string()),
                        Err(_) => FetchedPage::timed_out(
                            url.clone(),
                            format!("no result within {} ms", deadline.as_millis()),
                        ),
                    }
                }
            };
            (url.clone(), page)
        });
        join_all(tasks).await.into_iter().collect()
    }
}
