//! Backend doubles for gateway unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use parley_core::config::RecognitionConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{SynthesizedAudio, TranscriptEvent};
use parley_media::{RecognitionStream, SpeechRecognizer, SpeechSynthesizer, recognition_channel};
use parley_providers::ReplyGenerator;

/// Counts concurrent backend calls, possibly across several doubles.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replies `echo: <utterance>` unless told otherwise.
pub struct MockGenerator {
    reply: Option<String>,
    fail_on: HashSet<String>,
    delay: Duration,
    gauge: Arc<InFlight>,
    calls: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn echo() -> Self {
        Self {
            reply: None,
            fail_on: HashSet::new(),
            delay: Duration::ZERO,
            gauge: InFlight::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(reply: &str) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::echo()
        }
    }

    pub fn failing_on(mut self, utterance: &str) -> Self {
        self.fail_on.insert(utterance.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<InFlight>) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.current()
    }
}

#[async_trait]
impl ReplyGenerator for MockGenerator {
    fn id(&self) -> &str {
        "mock"
    }

    async fn generate(&self, utterance: &str) -> Result<String> {
        let _guard = self.gauge.enter();
        self.calls.lock().unwrap().push(utterance.to_string());
        tokio::time::sleep(self.delay).await;
        if self.fail_on.contains(utterance) {
            return Err(ParleyError::Generation("backend unavailable".into()));
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("echo: {utterance}")))
    }
}

/// Returns a short WAV-tagged payload derived from the text.
pub struct MockSynthesizer {
    silent_on: HashSet<String>,
    fail_on: HashSet<String>,
    stall_on: HashSet<String>,
    delay: Duration,
    gauge: Arc<InFlight>,
    calls: Mutex<Vec<String>>,
}

impl MockSynthesizer {
    pub fn audio() -> Self {
        Self {
            silent_on: HashSet::new(),
            fail_on: HashSet::new(),
            stall_on: HashSet::new(),
            delay: Duration::ZERO,
            gauge: InFlight::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn silent_on(mut self, text: &str) -> Self {
        self.silent_on.insert(text.into());
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on.insert(text.into());
        self
    }

    /// Never answer for `text`.
    pub fn stalling_on(mut self, text: &str) -> Self {
        self.stall_on.insert(text.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<InFlight>) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    fn id(&self) -> &str {
        "mock"
    }

    async fn synthesize(&self, text: &str) -> Result<Option<SynthesizedAudio>> {
        let _guard = self.gauge.enter();
        self.calls.lock().unwrap().push(text.to_string());
        tokio::time::sleep(self.delay).await;
        if self.stall_on.contains(text) {
            std::future::pending::<()>().await;
        }
        if self.fail_on.contains(text) {
            return Err(ParleyError::Synthesis("backend unavailable".into()));
        }
        if self.silent_on.contains(text) {
            return Ok(None);
        }
        Ok(Some(SynthesizedAudio::wav(format!("RIFF:{text}").into_bytes())))
    }
}

/// Recognizer whose audio frames are commands: `final:<text>`,
/// `partial:<text>`, or `drop` to lose the upstream connection.
#[derive(Default)]
pub struct ScriptedRecognizer {
    pub refuse: bool,
    pub opened: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _config: &RecognitionConfig) -> Result<RecognitionStream> {
        if self.refuse {
            return Err(ParleyError::ConnectionLost);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (stream, mut driver) = recognition_channel();
        let released = self.released.clone();
        tokio::spawn(async move {
            while let Some(chunk) = driver.next_audio().await {
                let command = String::from_utf8_lossy(&chunk.data).into_owned();
                let event = if let Some(text) = command.strip_prefix("final:") {
                    TranscriptEvent::final_text(text)
                } else if let Some(text) = command.strip_prefix("partial:") {
                    TranscriptEvent::partial(text)
                } else if command == "drop" {
                    break;
                } else {
                    continue;
                };
                if !driver.emit(event) {
                    break;
                }
            }
            released.fetch_add(1, Ordering::SeqCst);
            driver.release();
        });
        Ok(stream)
    }
}
