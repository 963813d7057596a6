//! Session coordinator: owns one client connection end to end.
//!
//! Client audio is forwarded to a recognition connection opened for the
//! session; transcripts feed an [`UtteranceSequencer`] running in its own
//! task; replies are written back by a writer task. Whatever ends the
//! session, the same teardown runs exactly once.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::protocol::{AudioChunk, OutputMessage};
use parley_core::session::SessionId;

use crate::sequencer::{SequencerExit, StageTimeouts, UtteranceSequencer};
use crate::state::GatewayState;

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client disconnected, failed a read, or stopped accepting writes.
    ClientGone,
    /// The recognition connection terminated.
    UpstreamClosed,
    /// The recognition connection could not be opened.
    RecognitionUnavailable,
    /// The session was cancelled from outside (gateway shutdown).
    Shutdown,
}

/// Handle an upgraded WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let (ws_tx, ws_rx) = ws.split();
    run_session(state, ws_rx, ws_tx).await;
}

/// Run one session over any message stream/sink pair.
pub async fn run_session<R, W>(state: Arc<GatewayState>, mut ws_rx: R, mut ws_tx: W) -> SessionEnd
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
{
    let session_id = SessionId::new();
    let cancel = state.register_session(session_id).await;
    let gateway = state.config.gateway();
    info!(session_id = %session_id, recognizer = state.recognizer.id(), "Session started");

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_started();

    let opened = tokio::time::timeout(
        gateway.connect_timeout(),
        state.recognizer.open(&state.config.recognition()),
    )
    .await;
    let stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, error = %e, "Failed to open recognition stream");
            return finish_early(&state, session_id, &mut ws_tx).await;
        }
        Err(_) => {
            warn!(
                session_id = %session_id,
                after_ms = gateway.recognition_connect_timeout_ms,
                "Timed out opening recognition stream"
            );
            return finish_early(&state, session_id, &mut ws_tx).await;
        }
    };
    let handle = stream.handle;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_outputs(ws_tx, out_rx, cancel.clone()));

    let sequencer = UtteranceSequencer::new(
        session_id,
        state.generator.clone(),
        state.synthesizer.clone(),
        StageTimeouts::from_config(&state.config),
    );
    let mut consumer = tokio::spawn(sequencer.run(stream.events, out_tx, cancel.clone()));

    let mut writer_result = None;
    let mut audio_bytes: u64 = 0;

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionEnd::Shutdown,
            exit = &mut consumer => {
                break match exit {
                    Ok(SequencerExit::StreamClosed) => SessionEnd::UpstreamClosed,
                    Ok(SequencerExit::ClientGone) => SessionEnd::ClientGone,
                    Ok(SequencerExit::Cancelled) => SessionEnd::Shutdown,
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Transcript consumer failed");
                        SessionEnd::UpstreamClosed
                    }
                };
            }
            written = &mut writer => {
                writer_result = Some(written);
                break SessionEnd::ClientGone;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    audio_bytes += data.len() as u64;
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break SessionEnd::Shutdown,
                        sent = handle.send(AudioChunk::new(data.to_vec())) => sent,
                    };
                    match sent {
                        Ok(()) => {}
                        Err(e) if e.is_session_fatal() => {
                            info!(session_id = %session_id, error = %e, "Recognition stream closed");
                            break SessionEnd::UpstreamClosed;
                        }
                        Err(e) => warn!(session_id = %session_id, error = %e, "Dropped audio chunk"),
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(session_id = %session_id, len = text.as_str().len(), "Ignoring text frame");
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::ClientGone,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "Client read failed");
                    break SessionEnd::ClientGone;
                }
            },
        }
    };

    // Teardown. Runs once whatever ended the loop.
    cancel.cancel();
    handle.close();
    if tokio::time::timeout(gateway.close_timeout(), handle.closed())
        .await
        .is_err()
    {
        warn!(
            session_id = %session_id,
            after_ms = gateway.close_timeout_ms,
            "Recognition connection not released in time"
        );
    }
    consumer.abort();

    let ws_tx = match writer_result {
        Some(written) => written.ok().flatten(),
        None => writer.await.ok().flatten(),
    };
    if let Some(mut ws_tx) = ws_tx {
        if end != SessionEnd::ClientGone {
            let _ = ws_tx.send(Message::Close(None)).await;
        }
        let _ = ws_tx.close().await;
    }

    state.unregister_session(session_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_ended();

    info!(session_id = %session_id, ?end, audio_bytes, "Session closed");
    end
}

/// Close the client connection when no recognition stream exists.
async fn finish_early<W>(state: &GatewayState, session_id: SessionId, ws_tx: &mut W) -> SessionEnd
where
    W: Sink<Message> + Unpin,
{
    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
    state.unregister_session(session_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_ended();

    info!(session_id = %session_id, end = ?SessionEnd::RecognitionUnavailable, "Session closed");
    SessionEnd::RecognitionUnavailable
}

/// Write replies to the client in order. Gives the sink back on
/// cancellation; returns `None` once a write failed.
async fn write_outputs<W>(
    mut ws_tx: W,
    mut out_rx: mpsc::UnboundedReceiver<OutputMessage>,
    cancel: CancellationToken,
) -> Option<W>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(ws_tx),
            msg = out_rx.recv() => {
                let Some(msg) = msg else {
                    cancel.cancelled().await;
                    return Some(ws_tx);
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "Failed to encode output message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                    debug!(error = %e, "Client write failed");
                    return None;
                }
            }
        }
    }
}
