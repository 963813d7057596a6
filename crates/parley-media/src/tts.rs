//! Speech synthesis: one blocking round-trip per reply.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::config::SynthesisConfig;
use parley_core::error::{ParleyError, Result, Stage};
use parley_core::protocol::SynthesizedAudio;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Backend identifier (e.g. "sarvam").
    fn id(&self) -> &str;

    /// Synthesize `text`. `Ok(None)` means the backend produced no audio.
    async fn synthesize(&self, text: &str) -> Result<Option<SynthesizedAudio>>;
}

/// Sarvam text-to-speech REST client.
pub struct SarvamSynthesizer {
    config: SynthesisConfig,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SarvamRequest<'a> {
    inputs: [&'a str; 1],
    target_language_code: &'a str,
    speaker: &'a str,
    pitch: f64,
    pace: f64,
    loudness: f64,
    speech_sample_rate: u32,
    enable_preprocessing: bool,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct SarvamResponse {
    #[serde(default)]
    audios: Vec<String>,
}

impl SarvamSynthesizer {
    pub fn new(config: SynthesisConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ParleyError::Config(format!("synthesis client: {e}")))?;
        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/text-to-speech", self.config.base_url.trim_end_matches('/'))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ParleyError {
        if e.is_timeout() {
            ParleyError::timeout(Stage::Synthesis, self.config.timeout())
        } else {
            ParleyError::Synthesis(e.to_string())
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SarvamSynthesizer {
    fn id(&self) -> &str {
        "sarvam"
    }

    async fn synthesize(&self, text: &str) -> Result<Option<SynthesizedAudio>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let body = SarvamRequest {
            inputs: [text],
            target_language_code: &self.config.target_language_code,
            speaker: &self.config.speaker,
            pitch: self.config.pitch,
            pace: self.config.pace,
            loudness: self.config.loudness,
            speech_sample_rate: self.config.sample_rate,
            enable_preprocessing: self.config.enable_preprocessing,
            model: &self.config.model,
        };

        debug!(speaker = %self.config.speaker, text_len = text.len(), "Requesting synthesis");

        let resp = self
            .client
            .post(self.endpoint())
            .header("API-Subscription-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ParleyError::Synthesis(format!("API error {status}: {body}")));
        }

        let raw = resp.bytes().await.map_err(|e| self.map_transport_error(e))?;
        let parsed: SarvamResponse = serde_json::from_slice(&raw)
            .map_err(|e| ParleyError::malformed(Stage::Synthesis, e.to_string()))?;

        let Some(encoded) = parsed.audios.into_iter().find(|a| !a.is_empty()) else {
            debug!("Synthesis produced no audio");
            return Ok(None);
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ParleyError::malformed(Stage::Synthesis, format!("audio payload: {e}")))?;

        debug!(audio_bytes = bytes.len(), "Synthesis complete");
        Ok(Some(SynthesizedAudio::wav(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};

    /// Serve `reply` from a local text-to-speech endpoint, echoing the
    /// request back into `seen`.
    async fn start_backend(
        status: StatusCode,
        reply: Value,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<(Option<String>, Value)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let app = axum::Router::new().route(
            "/text-to-speech",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let tx = tx.clone();
                let reply = reply.clone();
                async move {
                    let key = headers
                        .get("api-subscription-key")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = tx.send((key, body));
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

    fn synthesizer(base_url: String) -> SarvamSynthesizer {
        let config = SynthesisConfig {
            base_url,
            ..Default::default()
        };
        SarvamSynthesizer::new(config, "sv-key").unwrap()
    }

    #[tokio::test]
    async fn test_synthesize_decodes_audio() {
        let (url, mut seen) = start_backend(StatusCode::OK, json!({"audios": ["UklGRg=="]})).await;
        let audio = synthesizer(url)
            .synthesize("Hi! How can I help?")
            .await
            .unwrap()
            .expect("audio expected");
        assert_eq!(audio.bytes, b"RIFF");

        let (key, body) = seen.recv().await.unwrap();
        assert_eq!(key.as_deref(), Some("sv-key"));
        assert_eq!(body["inputs"][0], "Hi! How can I help?");
        assert_eq!(body["target_language_code"], "hi-IN");
        assert_eq!(body["speaker"], "anushka");
        assert_eq!(body["speech_sample_rate"], 8000);
        assert_eq!(body["model"], "bulbul:v2");
    }

    #[tokio::test]
    async fn test_no_audio_is_none() {
        let (url, _seen) = start_backend(StatusCode::OK, json!({"audios": []})).await;
        assert_eq!(synthesizer(url.clone()).synthesize("hello").await.unwrap(), None);

        let (url, _seen) = start_backend(StatusCode::OK, json!({"request_id": "x"})).await;
        assert_eq!(synthesizer(url).synthesize("hello").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backend_error_is_synthesis_error() {
        let (url, _seen) =
            start_backend(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})).await;
        let err = synthesizer(url).synthesize("hello").await.unwrap_err();
        assert!(matches!(err, ParleyError::Synthesis(ref m) if m.contains("500")), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_base64_is_malformed() {
        let (url, _seen) = start_backend(StatusCode::OK, json!({"audios": ["%%%"]})).await;
        let err = synthesizer(url).synthesize("hello").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Synthesis));
        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test]
    async fn test_empty_text_skips_backend() {
        let synth = synthesizer("http://127.0.0.1:1".into());
        assert_eq!(synth.synthesize("   ").await.unwrap(), None);
    }
}
