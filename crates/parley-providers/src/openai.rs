//! OpenAI-compatible Chat Completions provider.
//!
//! Non-streaming `/chat/completions` round-trip. Serves Groq and OpenAI,
//! which share the wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::config::GenerationConfig;
use parley_core::error::{ParleyError, Result, Stage};

use crate::ReplyGenerator;

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct ChatCompletionsGenerator {
    pub base_url: String,
    provider_id: String,
    config: GenerationConfig,
    api_key: String,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    pub fn groq(config: GenerationConfig, api_key: &str) -> Result<Self> {
        Self::with_defaults("groq", GROQ_BASE_URL, config, api_key)
    }

    pub fn openai(config: GenerationConfig, api_key: &str) -> Result<Self> {
        Self::with_defaults("openai", OPENAI_BASE_URL, config, api_key)
    }

    fn with_defaults(
        provider_id: &str,
        default_base_url: &str,
        config: GenerationConfig,
        api_key: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ParleyError::Config(format!("generation client: {e}")))?;
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(default_base_url)
                .trim_end_matches('/')
                .to_string(),
            provider_id: provider_id.into(),
            config,
            api_key: api_key.into(),
            client,
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ParleyError {
        if e.is_timeout() {
            ParleyError::timeout(Stage::Generation, self.config.timeout())
        } else {
            ParleyError::Generation(e.to_string())
        }
    }
}

// --- Request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ReplyGenerator for ChatCompletionsGenerator {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn generate(&self, utterance: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: utterance,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.provider_id, model = %self.config.model, "Requesting reply");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ParleyError::Generation(format!("API error {status}: {body}")));
        }

        let raw = resp.bytes().await.map_err(|e| self.map_transport_error(e))?;
        let parsed: ChatResponse = serde_json::from_slice(&raw)
            .map_err(|e| ParleyError::malformed(Stage::Generation, e.to_string()))?;

        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ParleyError::malformed(Stage::Generation, "no reply content"))?;

        debug!(reply_len = reply.len(), "Reply generated");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn start_backend(
        status: StatusCode,
        reply: Value,
        delay: Duration,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<(Option<String>, Value)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let app = axum::Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let tx = tx.clone();
                let reply = reply.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = tx.send((auth, body));
                    tokio::time::sleep(delay).await;
                    (status, Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), rx)
    }

    fn generator(base_url: String) -> ChatCompletionsGenerator {
        let config = GenerationConfig {
            base_url: Some(base_url),
            ..Default::default()
        };
        ChatCompletionsGenerator::groq(config, "gq-key").unwrap()
    }

    #[test]
    fn test_default_base_urls() {
        let groq = ChatCompletionsGenerator::groq(GenerationConfig::default(), "k").unwrap();
        assert_eq!(groq.base_url, GROQ_BASE_URL);
        let openai = ChatCompletionsGenerator::openai(GenerationConfig::default(), "k").unwrap();
        assert_eq!(openai.base_url, OPENAI_BASE_URL);
        assert_eq!(openai.id(), "openai");
    }

    #[tokio::test]
    async fn test_generate_sends_system_and_user_only() {
        let (url, mut seen) = start_backend(
            StatusCode::OK,
            json!({"choices": [{"message": {"role": "assistant", "content": "Hi! How can I help?"}}]}),
            Duration::ZERO,
        )
        .await;

        let reply = generator(url).generate("hello there").await.unwrap();
        assert_eq!(reply, "Hi! How can I help?");

        let (auth, body) = seen.recv().await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer gq-key"));
        assert_eq!(body["model"], "llama-3.3-70b-versatile");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello there");
        assert!(body.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn test_backend_error_is_generation_error() {
        let (url, _seen) = start_backend(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": {"message": "rate limited"}}),
            Duration::ZERO,
        )
        .await;
        let err = generator(url).generate("hello").await.unwrap_err();
        assert!(matches!(err, ParleyError::Generation(ref m) if m.contains("429")), "{err}");
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let (url, _seen) =
            start_backend(StatusCode::OK, json!({"choices": []}), Duration::ZERO).await;
        let err = generator(url).generate("hello").await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        assert_eq!(err.stage(), Some(Stage::Generation));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let (url, _seen) = start_backend(
            StatusCode::OK,
            json!({"choices": [{"message": {"content": "late"}}]}),
            Duration::from_secs(3),
        )
        .await;
        let config = GenerationConfig {
            base_url: Some(url),
            timeout_secs: 1,
            ..Default::default()
        };
        let err = ChatCompletionsGenerator::groq(config, "k")
            .unwrap()
            .generate("hello")
            .await
            .unwrap_err();
        assert!(
            matches!(err, ParleyError::Timeout { stage: Stage::Generation, .. }),
            "{err}"
        );
    }
}
