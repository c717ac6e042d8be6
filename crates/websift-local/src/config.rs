//! Environment-driven settings (`WEBSIFT_*`). Empty values are treated as unset.

use crate::gemini::GeminiClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::{env, env_bool, env_parse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use websift_core::{
    Error, Generator, Result, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_CONTENT_CHARS,
    DEFAULT_MAX_RESULTS,
};

pub const DEFAULT_TOP_K: usize = 2;
pub const DEFAULT_LLM_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize)]
pub struct ResearchConfig {
    /// Results requested from the search backend.
    pub max_results: usize,
    /// URLs fetched per question (fan-out width).
    pub top_k: usize,
    pub fetch_timeout_ms: u64,
    pub max_content_chars: usize,
    /// Rewrite the question into search keywords with the generator first.
    pub plan_queries: bool,
    /// Extra attempts after a `SearchUnavailable`; capped at 1.
    pub search_retries: u32,
    pub region: Option<String>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            top_k: DEFAULT_TOP_K,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            plan_queries: false,
            search_retries: 1,
            region: None,
        }
    }
}

impl ResearchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_results: env_parse("WEBSIFT_MAX_RESULTS").unwrap_or(d.max_results),
            top_k: env_parse("WEBSIFT_FETCH_TOP_K").unwrap_or(d.top_k),
            fetch_timeout_ms: env_parse::<u64>("WEBSIFT_FETCH_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(d.fetch_timeout_ms),
            max_content_chars: env_parse("WEBSIFT_MAX_CONTENT_CHARS")
                .unwrap_or(d.max_content_chars),
            plan_queries: env_bool("WEBSIFT_PLAN_QUERIES").unwrap_or(d.plan_queries),
            search_retries: env_parse::<u32>("WEBSIFT_SEARCH_RETRIES")
                .unwrap_or(d.search_retries)
                .min(1),
            region: env("WEBSIFT_SEARCH_REGION"),
        }
    }
}

pub fn llm_timeout_from_env() -> Duration {
    Duration::from_millis(
        env_parse::<u64>("WEBSIFT_LLM_TIMEOUT_MS")
            .unwrap_or(DEFAULT_LLM_TIMEOUT_MS)
            .clamp(1_000, 600_000),
    )
}

pub fn llm_provider_from_env() -> String {
    env("WEBSIFT_LLM_PROVIDER")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "openai".to_string())
}

/// Build the generator named by `WEBSIFT_LLM_PROVIDER` (`openai` | `gemini`).
pub fn generator_from_env(
    client: reqwest::Client,
    model_override: Option<String>,
) -> Result<Arc<dyn Generator>> {
    let timeout = llm_timeout_from_env();
    match llm_provider_from_env().as_str() {
        "openai" | "openai_compat" => Ok(Arc::new(OpenAiCompatClient::from_env(
            client,
            model_override,
            timeout,
        )?)),
        "gemini" => Ok(Arc::new(GeminiClient::from_env(
            client,
            model_override,
            timeout,
        )?)),
        other => Err(Error::NotConfigured(format!(
            "unknown WEBSIFT_LLM_PROVIDER: {other} (allowed: openai, gemini)"
        ))),
    }
}
