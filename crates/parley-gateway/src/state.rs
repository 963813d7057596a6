//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use parley_core::config::Config;
use parley_core::session::SessionId;
use parley_media::{SpeechRecognizer, SpeechSynthesizer};
use parley_providers::ReplyGenerator;

/// Shared gateway state: immutable config, backend service handles, and
/// a registry of live sessions.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,
}

/// Registry entry for a live session. Holds no pipeline state.
pub struct SessionEntry {
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            config,
            recognizer,
            generator,
            synthesizer,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a session and return its cancellation token.
    pub async fn register_session(&self, id: SessionId) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.sessions.write().await.insert(
            id,
            SessionEntry {
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub async fn unregister_session(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockGenerator, MockSynthesizer, ScriptedRecognizer};

    fn state() -> GatewayState {
        GatewayState::new(
            Arc::new(Config::default()),
            Arc::new(ScriptedRecognizer::new()),
            Arc::new(MockGenerator::echo()),
            Arc::new(MockSynthesizer::audio()),
        )
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let state = state();
        let id = SessionId::new();
        let cancel = state.register_session(id).await;
        assert_eq!(state.session_count().await, 1);
        assert!(!cancel.is_cancelled());

        state.unregister_session(id).await;
        assert_eq!(state.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_every_session() {
        let state = state();
        let a = state.register_session(SessionId::new()).await;
        let b = state.register_session(SessionId::new()).await;

        state.shutdown.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
