//! Deepgram live transcription over WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, trace, warn};

use parley_core::config::RecognitionConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{TranscriptEvent, TranscriptKind};

use crate::stt::{RecognitionDriver, RecognitionStream, SpeechRecognizer, recognition_channel};

/// Bound on the close handshake with the backend.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

pub struct DeepgramRecognizer {
    api_key: String,
}

impl DeepgramRecognizer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

/// Build the listen URL with every recognition option spelled out.
pub fn build_listen_url(config: &RecognitionConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.base_url)
        .map_err(|e| ParleyError::Config(format!("invalid recognition base_url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("model", &config.model)
            .append_pair("language", &config.language)
            .append_pair("channels", &config.channels.to_string())
            .append_pair("sample_rate", &config.sample_rate.to_string())
            .append_pair("smart_format", bool_str(config.smart_format))
            .append_pair("interim_results", bool_str(config.interim_results))
            .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string())
            .append_pair("vad_events", bool_str(config.vad_events));
        if let Some(encoding) = &config.encoding {
            query.append_pair("encoding", encoding);
        }
        match config.endpointing_ms {
            Some(ms) => query.append_pair("endpointing", &ms.to_string()),
            None => query.append_pair("endpointing", "false"),
        };
    }
    Ok(url)
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn open(&self, config: &RecognitionConfig) -> Result<RecognitionStream> {
        let url = build_listen_url(config)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ParleyError::StreamClosed(format!("invalid request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| ParleyError::Config(format!("invalid recognition API key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        debug!(model = %config.model, language = %config.language, "Opening recognition stream");

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| ParleyError::StreamClosed(format!("connect failed: {e}")))?;
        debug!(status = %response.status(), "Recognition stream connected");

        let keepalive = Duration::from_secs(config.keepalive_secs.max(1));
        let (stream, driver) = recognition_channel();
        tokio::spawn(drive_socket(socket, driver, keepalive));

        Ok(stream)
    }
}

/// Pump audio up and transcripts down until either side ends, then
/// release the socket.
async fn drive_socket<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut driver: RecognitionDriver,
    keepalive: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut incoming) = socket.split();
    let mut keepalive_timer = interval_at(Instant::now() + keepalive, keepalive);

    let reason = loop {
        tokio::select! {
            chunk = driver.next_audio() => match chunk {
                Some(chunk) => {
                    keepalive_timer.reset();
                    trace!(bytes = chunk.len(), "Forwarding audio");
                    let frame = Message::Binary(chunk.data.into());
                    if let Err(reason) = send_frame(&mut sink, frame, &driver).await {
                        break format!("audio send failed: {reason}");
                    }
                }
                None => break "closed by session".to_string(),
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(text.as_str()) {
                        if !driver.emit(event) {
                            break "transcript consumer dropped".to_string();
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break format!("upstream closed: {frame:?}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("upstream error: {e}"),
                None => break "upstream ended".to_string(),
            },
            _ = keepalive_timer.tick() => {
                trace!("Sending keep-alive");
                let frame = Message::Text(r#"{"type":"KeepAlive"}"#.into());
                if let Err(reason) = send_frame(&mut sink, frame, &driver).await {
                    break format!("keep-alive failed: {reason}");
                }
            }
        }
    };

    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        let _ = sink
            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
            .await;
        let _ = sink.close().await;
    })
    .await;
    drop(sink);
    drop(incoming);

    driver.release();
    info!(%reason, "Recognition stream released");
}

/// Send one frame upstream. A backend that stops reading blocks the write,
/// so a close request from the session abandons it.
async fn send_frame<K>(
    sink: &mut K,
    frame: Message,
    driver: &RecognitionDriver,
) -> std::result::Result<(), String>
where
    K: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    tokio::select! {
        biased;
        _ = driver.cancelled() => Err("closed by session while upstream stalled".into()),
        sent = sink.send(frame) => sent.map_err(|e| e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ListenMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<ChannelField>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

/// Some payloads carry the channel as an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelField {
    One(ListenChannel),
    Many(Vec<ListenChannel>),
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Parse one backend message into a transcript event, if it is one.
pub fn parse_message(text: &str) -> Option<TranscriptEvent> {
    let msg: ListenMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%e, "Unparseable recognition message");
            return None;
        }
    };

    if msg.kind != "Results" {
        debug!(kind = %msg.kind, "Recognition control message");
        return None;
    }

    let channel = match msg.channel? {
        ChannelField::One(channel) => channel,
        ChannelField::Many(channels) => channels.into_iter().next()?,
    };
    let text = channel
        .alternatives
        .into_iter()
        .next()
        .map(|a| a.transcript)
        .unwrap_or_default();

    if !text.is_empty() {
        debug!(transcript = %text, is_final = msg.is_final, "Transcript");
    }

    Some(TranscriptEvent {
        kind: if msg.is_final {
            TranscriptKind::Final
        } else {
            TranscriptKind::Partial
        },
        text,
        utterance_end: msg.speech_final,
    })
}
