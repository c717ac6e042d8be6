use crate::env;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use websift_core::{Error, Generator, Result};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

fn openai_base_url_from_env() -> String {
    env("WEBSIFT_OPENAI_BASE_URL")
        .or_else(|| env("OPENAI_BASE_URL"))
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
}

fn openai_api_key_from_env() -> Option<String> {
    env("WEBSIFT_OPENAI_API_KEY").or_else(|| env("OPENAI_API_KEY"))
}

fn openai_model_from_env() -> Option<String> {
    env("WEBSIFT_OPENAI_MODEL")
}

/// Chat-completions client for OpenAI and compatible servers (vLLM, llama.cpp, OpenRouter...).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env(
        client: reqwest::Client,
        model_override: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = openai_base_url_from_env();
        let api_key = openai_api_key_from_env();
        // The public endpoint always needs a key; self-hosted compatible servers may not.
        if api_key.is_none() && base_url.trim_end_matches('/') == DEFAULT_OPENAI_BASE_URL {
            return Err(Error::NotConfigured(
                "missing WEBSIFT_OPENAI_API_KEY (or OPENAI_API_KEY)".to_string(),
            ));
        }
        let model = model_override
            .or_else(openai_model_from_env)
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        Ok(Self {
            api_key,
            timeout,
            ..Self::new(client, base_url, model)
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl Generator for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(self.temperature),
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::GenerationUnavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::GenerationUnavailable(format!(
                "openai chat.completions HTTP {status}"
            )));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::GenerationUnavailable(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(Error::GenerationUnavailable(
                "openai chat.completions returned no content".to_string(),
            ));
        }
        Ok(text)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    // `null` when the model answered with a tool call only.
    content: Option<String>,
}
