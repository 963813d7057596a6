//! Data flowing through a session: audio in, transcript events, replies out.
//!
//! Client wire format is JSON-over-WebSocket for server messages and raw
//! binary frames for audio.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque chunk of client audio. Not retained after forwarding.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            received_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// A transcript update from the recognition backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    /// The backend considers the utterance complete (end of speech).
    #[serde(default)]
    pub utterance_end: bool,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
            utterance_end: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
            utterance_end: true,
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }

    /// Finalized text worth replying to, if any.
    pub fn finalized_text(&self) -> Option<&str> {
        let text = self.text.trim();
        (self.is_final() && !text.is_empty()).then_some(text)
    }
}

/// Encoded audio returned by the synthesis backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl SynthesizedAudio {
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: "audio/wav".into(),
        }
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Server -> client message. One per completed utterance cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMessage {
    Audio {
        /// Base64-encoded audio.
        #[serde(rename = "data")]
        payload: String,
        text: String,
    },
}

impl OutputMessage {
    pub fn audio(audio: &SynthesizedAudio, text: impl Into<String>) -> Self {
        Self::Audio {
            payload: audio.to_base64(),
            text: text.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Audio { text, .. } => text,
        }
    }
}
