//! Text-generation provider abstraction.
//!
//! Each provider implements [`ReplyGenerator`]: one finalized utterance in,
//! one complete reply out. Calls are stateless; no conversation history is
//! carried between them.

use std::sync::Arc;

use async_trait::async_trait;

use parley_core::config::GenerationConfig;
use parley_core::error::{ParleyError, Result};

pub mod openai;

pub use openai::ChatCompletionsGenerator;

/// The core generation trait.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Provider identifier (e.g., "groq", "openai").
    fn id(&self) -> &str;

    /// Produce a reply to `utterance`. Never returns a partial reply.
    async fn generate(&self, utterance: &str) -> Result<String>;
}

/// Build the configured generator.
pub fn from_config(config: &GenerationConfig, api_key: &str) -> Result<Arc<dyn ReplyGenerator>> {
    let generator = match config.provider.as_str() {
        "groq" => ChatCompletionsGenerator::groq(config.clone(), api_key)?,
        "openai" => ChatCompletionsGenerator::openai(config.clone(), api_key)?,
        other => {
            return Err(ParleyError::Config(format!(
                "unknown generation provider: {other}"
            )));
        }
    };
    Ok(Arc::new(generator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_provider() {
        let config = GenerationConfig::default();
        assert_eq!(from_config(&config, "k").unwrap().id(), "groq");

        let config = GenerationConfig {
            provider: "openai".into(),
            ..Default::default()
        };
        assert_eq!(from_config(&config, "k").unwrap().id(), "openai");

        let config = GenerationConfig {
            provider: "bedrock".into(),
            ..Default::default()
        };
        assert!(matches!(from_config(&config, "k"), Err(ParleyError::Config(_))));
    }
}
