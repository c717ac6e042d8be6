//! Gemini `generateContent` backend for answer generation.

use crate::env;
use serde::Serialize;
use std::time::Duration;
use websift_core::{Error, Generator, Result};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

pub fn gemini_api_key_from_env() -> Option<String> {
    env("WEBSIFT_GEMINI_API_KEY")
        .or_else(|| env("GEMINI_API_KEY"))
        .or_else(|| env("GOOGLE_API_KEY"))
}

#[derive(Debug, Serialize)]
struct ReqPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct ReqContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<ReqPart>,
}

#[derive(Debug, Serialize)]
struct GenCfg {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct GeminiReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ReqContent>,
    contents: Vec<ReqContent>,
    generation_config: GenCfg,
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env(
        client: reqwest::Client,
        model_override: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let key = gemini_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing WEBSIFT_GEMINI_API_KEY (or GEMINI_API_KEY / GOOGLE_API_KEY)".to_string(),
            )
        })?;
        let mut c = Self::new(client, key).with_timeout(timeout);
        if let Some(base) = env("WEBSIFT_GEMINI_BASE_URL") {
            c.base_url = base;
        }
        if let Some(model) = model_override.or_else(|| env("WEBSIFT_GEMINI_MODEL")) {
            c.model = model;
        }
        Ok(c)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

/// `candidates[0].content.parts[*].text`, newline-joined.
fn candidate_text(v: &serde_json::Value) -> String {
    let mut out = String::new();
    let parts = v
        .get("candidates")
        .and_then(|x| x.as_array())
        .and_then(|c| c.first())
        .and_then(|c0| c0.get("content"))
        .and_then(|x| x.get("parts"))
        .and_then(|x| x.as_array());
    for p in parts.into_iter().flatten() {
        if let Some(t) = p.get("text").and_then(|x| x.as_str()) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(t);
        }
    }
    out
}

#[async_trait::async_trait]
impl Generator for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        let req = GeminiReq {
            system_instruction: (!system.trim().is_empty()).then(|| ReqContent {
                role: None,
                parts: vec![ReqPart {
                    text: system.to_string(),
                }],
            }),
            contents: vec![ReqContent {
                role: Some("user"),
                parts: vec![ReqPart {
                    text: user.to_string(),
                }],
            }],
            generation_config: GenCfg { temperature: 0.0 },
        };

        // Key goes in a header rather than the query string so it never lands in error text.
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::GenerationUnavailable(e.without_url().to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::GenerationUnavailable(format!(
                "gemini generateContent HTTP {status}"
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::GenerationUnavailable(e.to_string()))?;
        let text = candidate_text(&v);
        if text.trim().is_empty() {
            return Err(Error::GenerationUnavailable(
                "gemini returned no candidate text".to_string(),
            ));
        }
        Ok(text)
    }
}
