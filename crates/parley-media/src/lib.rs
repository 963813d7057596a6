//! Speech adapters: streaming recognition in, synthesized audio out.

pub mod deepgram;
pub mod stt;
pub mod tts;

pub use deepgram::DeepgramRecognizer;
pub use stt::{
    RecognitionDriver, RecognitionHandle, RecognitionStream, SpeechRecognizer, TranscriptStream,
    recognition_channel,
};
pub use tts::{SarvamSynthesizer, SpeechSynthesizer};
