//! Utterance sequencer: turns finalized transcripts into replies, one
//! generation+synthesis cycle at a time.
//!
//! While a cycle is in flight, at most one further utterance is queued;
//! a newer final transcript replaces the queued one. Cycles therefore
//! never overlap and replies reach the client in utterance order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::config::Config;
use parley_core::error::{ParleyError, Result, Stage};
use parley_core::protocol::{OutputMessage, SynthesizedAudio, TranscriptEvent};
use parley_core::session::{PendingUtterance, PipelineState, SessionId};
use parley_media::SpeechSynthesizer;
use parley_providers::ReplyGenerator;

/// Upper bounds for each blocking backend call.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub generation: Duration,
    pub synthesis: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generation: config.generation().timeout(),
            synthesis: config.synthesis().timeout(),
        }
    }
}

/// Why the sequencer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerExit {
    /// The transcript stream ended (upstream connection gone).
    StreamClosed,
    /// The session was cancelled.
    Cancelled,
    /// Output could not be delivered; nobody is writing to the client.
    ClientGone,
}

enum StageResult {
    Generated(Result<String>),
    Synthesized {
        reply: String,
        audio: Result<Option<SynthesizedAudio>>,
    },
}

type StageFuture = Pin<Box<dyn Future<Output = StageResult> + Send>>;

pub struct UtteranceSequencer {
    session_id: SessionId,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    timeouts: StageTimeouts,
    state: PipelineState,
    active: Option<PendingUtterance>,
    queued: Option<PendingUtterance>,
    next_seq: u64,
    cycle_started: Option<Instant>,
}

impl UtteranceSequencer {
    pub fn new(
        session_id: SessionId,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            session_id,
            generator,
            synthesizer,
            timeouts,
            state: PipelineState::Idle,
            active: None,
            queued: None,
            next_seq: 0,
            cycle_started: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Consume transcript events until the stream ends, the session is
    /// cancelled, or the client is gone. Replies go to `out_tx` in order.
    pub async fn run<S>(
        mut self,
        mut events: S,
        out_tx: mpsc::UnboundedSender<OutputMessage>,
        cancel: CancellationToken,
    ) -> SequencerExit
    where
        S: Stream<Item = TranscriptEvent> + Unpin,
    {
        let mut stage: Option<StageFuture> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if stage.is_some() {
                        debug!(session_id = %self.session_id, state = ?self.state, "Abandoning in-flight cycle");
                    }
                    return SequencerExit::Cancelled;
                }
                result = async {
                    match stage.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                } => {
                    let (next, output) = self.on_stage_done(result);
                    stage = next;
                    if let Some(output) = output {
                        if out_tx.send(output).is_err() {
                            return SequencerExit::ClientGone;
                        }
                    }
                }
                event = events.next() => match event {
                    Some(event) => {
                        if let Some(utterance) = self.accept(event) {
                            stage = Some(self.start_generation(utterance));
                        }
                    }
                    None => {
                        if stage.is_some() {
                            debug!(session_id = %self.session_id, "Transcript stream ended mid-cycle");
                        }
                        return SequencerExit::StreamClosed;
                    }
                },
            }
        }
    }

    /// Take one transcript event. Returns the utterance to start now when
    /// idle; otherwise queues it, replacing any queued one.
    fn accept(&mut self, event: TranscriptEvent) -> Option<PendingUtterance> {
        let Some(text) = event.finalized_text() else {
            trace!(session_id = %self.session_id, is_final = event.is_final(), "Skipping transcript event");
            return None;
        };

        let utterance = PendingUtterance::new(self.next_seq, text);
        self.next_seq += 1;
        info!(session_id = %self.session_id, seq = utterance.seq, text = %utterance.text, "Finalized utterance");

        if self.state.is_idle() {
            return Some(utterance);
        }

        if let Some(replaced) = self.queued.replace(utterance) {
            debug!(session_id = %self.session_id, seq = replaced.seq, "Queued utterance superseded");
        }
        None
    }

    fn start_generation(&mut self, utterance: PendingUtterance) -> StageFuture {
        self.state = PipelineState::Generating;
        self.cycle_started = Some(Instant::now());
        debug!(session_id = %self.session_id, seq = utterance.seq, "Cycle started");

        let generator = self.generator.clone();
        let limit = self.timeouts.generation;
        let text = utterance.text.clone();
        self.active = Some(utterance);

        Box::pin(async move {
            let result = tokio::time::timeout(limit, generator.generate(&text))
                .await
                .unwrap_or_else(|_| Err(ParleyError::timeout(Stage::Generation, limit)));
            StageResult::Generated(result)
        })
    }

    fn start_synthesis(&mut self, reply: String) -> StageFuture {
        self.state = PipelineState::Synthesizing;

        let synthesizer = self.synthesizer.clone();
        let limit = self.timeouts.synthesis;

        Box::pin(async move {
            let audio = tokio::time::timeout(limit, synthesizer.synthesize(&reply))
                .await
                .unwrap_or_else(|_| Err(ParleyError::timeout(Stage::Synthesis, limit)));
            StageResult::Synthesized { reply, audio }
        })
    }

    /// Advance the state machine after a stage finished. Returns the next
    /// stage to run and the message to deliver, if any.
    fn on_stage_done(&mut self, result: StageResult) -> (Option<StageFuture>, Option<OutputMessage>) {
        let seq = self.active.as_ref().map(|u| u.seq);

        let output = match result {
            StageResult::Generated(Ok(reply)) => {
                debug!(session_id = %self.session_id, ?seq, reply = %reply, "Reply generated");
                return (Some(self.start_synthesis(reply)), None);
            }
            StageResult::Generated(Err(e)) => {
                self.report_failure(seq, &e);
                None
            }
            StageResult::Synthesized {
                reply,
                audio: Ok(Some(audio)),
            } => {
                let since_final_ms = self
                    .active
                    .as_ref()
                    .map(|u| (Utc::now() - u.finalized_at).num_milliseconds());
                info!(
                    session_id = %self.session_id,
                    ?seq,
                    audio_bytes = audio.bytes.len(),
                    ?since_final_ms,
                    "Reply ready"
                );
                Some(OutputMessage::audio(&audio, reply))
            }
            StageResult::Synthesized { audio: Ok(None), .. } => {
                info!(session_id = %self.session_id, ?seq, "Synthesis produced no audio, skipping reply");
                #[cfg(feature = "metrics")]
                crate::metrics::record_stage_failure("no_audio");
                None
            }
            StageResult::Synthesized { audio: Err(e), .. } => {
                self.report_failure(seq, &e);
                None
            }
        };

        self.finish_cycle(output.is_some());
        let next = self.queued.take().map(|u| self.start_generation(u));
        (next, output)
    }

    fn report_failure(&self, seq: Option<u64>, error: &ParleyError) {
        warn!(
            session_id = %self.session_id,
            ?seq,
            stage = ?error.stage(),
            kind = error.kind(),
            %error,
            "Cycle abandoned"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_stage_failure(error.stage().map(|s| s.as_str()).unwrap_or("other"));
    }

    fn finish_cycle(&mut self, delivered: bool) {
        if let Some(started) = self.cycle_started.take() {
            let elapsed = started.elapsed();
            debug!(session_id = %self.session_id, elapsed_ms = elapsed.as_millis() as u64, delivered, "Cycle finished");
            #[cfg(feature = "metrics")]
            crate::metrics::record_cycle_finished(elapsed.as_secs_f64(), delivered);
        }
        self.active = None;
        self.state = PipelineState::Idle;
    }
}
