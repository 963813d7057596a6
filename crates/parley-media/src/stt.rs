//! Streaming speech recognition contract.
//!
//! A [`RecognitionStream`] is two halves of one upstream connection: the
//! [`RecognitionHandle`] pushes audio in and controls shutdown, the
//! [`TranscriptStream`] yields transcript events out. Backends get the
//! matching [`RecognitionDriver`] from [`recognition_channel`] and run the
//! connection in their own task.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use parley_core::config::RecognitionConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{AudioChunk, TranscriptEvent};

/// Audio chunks buffered between the session and the upstream socket.
pub const AUDIO_QUEUE_DEPTH: usize = 64;

/// Opens streaming recognition connections.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Backend identifier (e.g. "deepgram").
    fn id(&self) -> &str;

    /// Open one live upstream connection.
    async fn open(&self, config: &RecognitionConfig) -> Result<RecognitionStream>;
}

/// A live recognition connection, split for concurrent use.
pub struct RecognitionStream {
    pub handle: RecognitionHandle,
    pub events: TranscriptStream,
}

/// Create the session-side stream and the backend-side driver of one
/// recognition connection.
pub fn recognition_channel() -> (RecognitionStream, RecognitionDriver) {
    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (released_tx, released_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let stream = RecognitionStream {
        handle: RecognitionHandle {
            audio_tx,
            cancel: cancel.clone(),
            released: released_rx,
        },
        events: TranscriptStream {
            inner: UnboundedReceiverStream::new(event_rx),
        },
    };
    let driver = RecognitionDriver {
        audio_rx,
        event_tx,
        cancel,
        released: released_tx,
    };
    (stream, driver)
}

/// Session-side control of a recognition connection.
///
/// Dropping the handle closes the connection.
pub struct RecognitionHandle {
    audio_tx: mpsc::Sender<AudioChunk>,
    cancel: CancellationToken,
    released: watch::Receiver<bool>,
}

impl RecognitionHandle {
    /// Forward audio upstream. Fails with `StreamClosed` once the
    /// connection has terminated or been closed.
    pub async fn send(&self, chunk: AudioChunk) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ParleyError::StreamClosed("stream was closed".into()));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(ParleyError::StreamClosed("stream was closed".into()))
            }
            sent = self.audio_tx.send(chunk) => sent.map_err(|_| {
                ParleyError::StreamClosed("upstream connection terminated".into())
            }),
        }
    }

    /// Request shutdown of the upstream connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the upstream connection has been released.
    pub async fn closed(&self) {
        let mut released = self.released.clone();
        // An Err means the driver is gone, which also releases the connection.
        let _ = released.wait_for(|released| *released).await;
    }

    /// Whether the upstream connection has been released.
    pub fn is_closed(&self) -> bool {
        *self.released.borrow() || self.released.has_changed().is_err()
    }
}

impl Drop for RecognitionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Lazy, non-restartable sequence of transcript events. Ends when the
/// upstream connection ends.
pub struct TranscriptStream {
    inner: UnboundedReceiverStream<TranscriptEvent>,
}

impl Stream for TranscriptStream {
    type Item = TranscriptEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Backend-side endpoint of a recognition connection.
pub struct RecognitionDriver {
    audio_rx: mpsc::Receiver<AudioChunk>,
    event_tx: mpsc::UnboundedSender<TranscriptEvent>,
    cancel: CancellationToken,
    released: watch::Sender<bool>,
}

impl RecognitionDriver {
    /// Next audio chunk to forward, or `None` once the session closed the
    /// stream or dropped its handle. Cancel-safe.
    pub async fn next_audio(&mut self) -> Option<AudioChunk> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = self.audio_rx.recv() => chunk,
        }
    }

    /// Deliver an event to the session. Returns false if nobody listens.
    pub fn emit(&self, event: TranscriptEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session asked for shutdown.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Mark the upstream connection as released. Ends the transcript stream.
    pub fn release(self) {
        self.cancel.cancel();
        let _ = self.released.send(true);
    }
}
