use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{classify_status, classify_transport, ProviderError};
use crate::provider::{Completion, CompletionRequest, Provider};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// HTTP provider speaking either the OpenAI-compatible or the Anthropic API.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama and any other endpoint that
/// implements the OpenAI chat completions API, plus Anthropic messages.
pub struct HttpProvider {
    config: ProviderConfig,
    api_key: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpProvider {
    /// Build a provider with a resolved API key and a per-request deadline.
    pub fn new(config: ProviderConfig, api_key: String, timeout: Duration) -> Self {
        Self {
            config,
            api_key,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    fn url(&self) -> String {
        match self.config.kind {
            ProviderKind::OpenAi => format!("{}/v1/chat/completions", self.config.base_url()),
            ProviderKind::Anthropic => format!("{}/v1/messages", self.config.base_url()),
        }
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let max_tokens = request.max_tokens.min(self.config.max_tokens);
        let temperature = request.temperature.unwrap_or(self.config.temperature);
        match self.config.kind {
            ProviderKind::OpenAi => {
                let mut messages = Vec::new();
                if let Some(sys) = &request.system_prompt {
                    messages.push(serde_json::json!({"role": "system", "content": sys}));
                }
                messages.push(serde_json::json!({"role": "user", "content": request.prompt}));
                serde_json::json!({
                    "model": self.config.model,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                    "messages": messages,
                })
            }
            ProviderKind::Anthropic => {
                let mut body = serde_json::json!({
                    "model": self.config.model,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                    "messages": [{"role": "user", "content": request.prompt}],
                });
                if let Some(sys) = &request.system_prompt {
                    body["system"] = serde_json::json!(sys);
                }
                body
            }
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("content-type", "application/json");
        match self.config.kind {
            ProviderKind::OpenAi => {
                request.header("Authorization", format!("Bearer {}", self.api_key))
            }
            ProviderKind::Anthropic => request
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let url = self.url();
        debug!(provider = %self.config.id, url = %url, "Sending completion request");

        let resp = self
            .authorize(self.http.post(&url))
            .timeout(self.timeout)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body, retry_after));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;

        match self.config.kind {
            ProviderKind::OpenAi => parse_openai_response(&body),
            ProviderKind::Anthropic => parse_anthropic_response(&body),
        }
    }
}

/// Extract the first choice's message text.
pub fn parse_openai_response(body: &serde_json::Value) -> Result<Completion, ProviderError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| {
            ProviderError::Transient("missing choices[0].message.content in response".into())
        })?;
    Ok(Completion {
        text: text.to_string(),
        model: body["model"].as_str().map(str::to_string),
    })
}

/// Join the text blocks of a messages response.
pub fn parse_anthropic_response(body: &serde_json::Value) -> Result<Completion, ProviderError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Transient("missing content in response".into()))?;

    let text_parts: Vec<&str> = content
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect();

    Ok(Completion {
        text: text_parts.join("\n"),
        model: body["model"].as_str().map(str::to_string),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            id: "p".into(),
            kind,
            model: "m-1".into(),
            api_key: None,
            api_key_env: None,
            base_url: Some("http://127.0.0.1:1".into()),
            max_tokens: 512,
            temperature: 0.3,
        }
    }

    #[test]
    fn test_openai_body_shape() {
        let provider = HttpProvider::new(
            config(ProviderKind::OpenAi),
            "k".into(),
            Duration::from_secs(1),
        );
        let body = provider.body(
            &CompletionRequest::new("hi")
                .with_system("sys")
                .with_max_tokens(4096),
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        // Capped by the provider's own budget.
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn test_anthropic_body_puts_system_at_top_level() {
        let provider = HttpProvider::new(
            config(ProviderKind::Anthropic),
            "k".into(),
            Duration::from_secs(1),
        );
        let body = provider.body(&CompletionRequest::new("hi").with_system("sys"));
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(provider.url(), "http://127.0.0.1:1/v1/messages");
    }

    #[test]
    fn test_parse_responses() {
        let openai = serde_json::json!({
            "model": "gpt",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(parse_openai_response(&openai).unwrap().text, "hello");
        assert!(parse_openai_response(&serde_json::json!({})).is_err());

        let anthropic = serde_json::json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "tool_use", "id": "t"},
                {"type": "text", "text": "b"}
            ]
        });
        assert_eq!(parse_anthropic_response(&anthropic).unwrap().text, "a\nb");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let provider = HttpProvider::new(
            config(ProviderKind::OpenAi),
            "k".into(),
            Duration::from_secs(2),
        );
        let err = provider
            .complete(&CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
