//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Current version of the recognition option set.
pub const RECOGNITION_CONFIG_VERSION: u32 = 1;

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<RecognitionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// WebSocket path for audio sessions.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// CORS origins; `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Upper bound for opening the recognition stream.
    #[serde(default = "default_connect_timeout_ms")]
    pub recognition_connect_timeout_ms: u64,

    /// Upper bound for releasing the recognition stream at teardown.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_ws_path() -> String {
    "/ws/audio".into()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            path: default_ws_path(),
            allowed_origins: default_allowed_origins(),
            recognition_connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

// --- Recognition ---

/// Streaming speech-recognition options. One canonical option set;
/// `version` identifies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_version")]
    pub version: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_recognition_url")]
    pub base_url: String,

    #[serde(default = "default_recognition_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// Sample encoding. `None` lets the backend detect containerised audio.
    #[serde(default = "default_encoding")]
    pub encoding: Option<String>,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_recognition_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_true")]
    pub smart_format: bool,

    #[serde(default = "default_true")]
    pub interim_results: bool,

    /// Silence (ms) after which the backend closes an utterance.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,

    #[serde(default = "default_true")]
    pub vad_events: bool,

    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: Option<u32>,

    /// Idle seconds between keep-alive messages while no audio flows.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_recognition_version() -> u32 {
    RECOGNITION_CONFIG_VERSION
}

fn default_recognition_url() -> String {
    "wss://api.deepgram.com/v1/listen".into()
}

fn default_recognition_model() -> String {
    "nova-2".into()
}

fn default_language() -> String {
    "en-US".into()
}

fn default_encoding() -> Option<String> {
    Some("linear16".into())
}

fn default_channels() -> u16 {
    1
}

fn default_recognition_sample_rate() -> u32 {
    16_000
}

fn default_utterance_end_ms() -> u32 {
    1_000
}

fn default_endpointing_ms() -> Option<u32> {
    Some(300)
}

fn default_keepalive_secs() -> u64 {
    8
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            version: default_recognition_version(),
            api_key: None,
            api_key_env: None,
            base_url: default_recognition_url(),
            model: default_recognition_model(),
            language: default_language(),
            encoding: default_encoding(),
            channels: default_channels(),
            sample_rate: default_recognition_sample_rate(),
            smart_format: true,
            interim_results: true,
            utterance_end_ms: default_utterance_end_ms(),
            vad_events: true,
            endpointing_ms: default_endpointing_ms(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl RecognitionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_env("DEEPGRAM_API_KEY"))
    }
}

// --- Generation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

fn default_generation_provider() -> String {
    "groq".into()
}

fn default_generation_model() -> String {
    "llama-3.3-70b-versatile".into()
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep your responses concise and conversational.".into()
}

fn default_generation_timeout() -> u64 {
    20
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: default_generation_model(),
            system_prompt: default_system_prompt(),
            max_tokens: None,
            temperature: None,
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback = match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY",
            _ => "GROQ_API_KEY",
        };
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| resolve_env(fallback))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// --- Synthesis ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_synthesis_url")]
    pub base_url: String,

    #[serde(default = "default_synthesis_model")]
    pub model: String,

    #[serde(default = "default_target_language")]
    pub target_language_code: String,

    #[serde(default = "default_speaker")]
    pub speaker: String,

    #[serde(default)]
    pub pitch: f64,

    #[serde(default = "default_pace")]
    pub pace: f64,

    #[serde(default = "default_loudness")]
    pub loudness: f64,

    #[serde(default = "default_synthesis_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_true")]
    pub enable_preprocessing: bool,

    #[serde(default = "default_synthesis_timeout")]
    pub timeout_secs: u64,
}

fn default_synthesis_url() -> String {
    "https://api.sarvam.ai".into()
}

fn default_synthesis_model() -> String {
    "bulbul:v2".into()
}

fn default_target_language() -> String {
    "hi-IN".into()
}

fn default_speaker() -> String {
    "anushka".into()
}

fn default_pace() -> f64 {
    1.2
}

fn default_loudness() -> f64 {
    1.5
}

fn default_synthesis_sample_rate() -> u32 {
    8_000
}

fn default_synthesis_timeout() -> u64 {
    15
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: None,
            base_url: default_synthesis_url(),
            model: default_synthesis_model(),
            target_language_code: default_target_language(),
            speaker: default_speaker(),
            pitch: 0.0,
            pace: default_pace(),
            loudness: default_loudness(),
            sample_rate: default_synthesis_sample_rate(),
            enable_preprocessing: true,
            timeout_secs: default_synthesis_timeout(),
        }
    }
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_env("SARVAM_API_KEY"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// --- Logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

// --- Credentials ---

/// The three backend credentials, resolved once at startup.
#[derive(Clone)]
pub struct BackendCredentials {
    pub recognition: String,
    pub generation: String,
    pub synthesis: String,
}

impl std::fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("recognition", &"<redacted>")
            .field("generation", &"<redacted>")
            .field("synthesis", &"<redacted>")
            .finish()
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    env_var.as_deref().and_then(resolve_env)
}

fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn recognition(&self) -> RecognitionConfig {
        self.recognition.clone().unwrap_or_default()
    }

    pub fn generation(&self) -> GenerationConfig {
        self.generation.clone().unwrap_or_default()
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Resolve all backend credentials, failing with every missing one listed.
    pub fn resolve_credentials(&self) -> Result<BackendCredentials> {
        let recognition = self.recognition().resolve_api_key();
        let generation = self.generation().resolve_api_key();
        let synthesis = self.synthesis().resolve_api_key();

        match (recognition, generation, synthesis) {
            (Some(recognition), Some(generation), Some(synthesis)) => Ok(BackendCredentials {
                recognition,
                generation,
                synthesis,
            }),
            (r, g, s) => {
                let missing: Vec<&str> = [
                    ("recognition", r.is_none()),
                    ("generation", g.is_none()),
                    ("synthesis", s.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, is_missing)| is_missing.then_some(name))
                .collect();
                Err(ParleyError::Config(format!(
                    "missing API key for: {}",
                    missing.join(", ")
                )))
            }
        }
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let gateway = self.gateway();
        if gateway.port == 0 {
            errors.push("Gateway port cannot be 0".to_string());
        }
        if !gateway.path.starts_with('/') {
            errors.push(format!("Gateway path must start with '/': {}", gateway.path));
        }
        if gateway.close_timeout_ms == 0 || gateway.recognition_connect_timeout_ms == 0 {
            errors.push("Gateway timeouts must be non-zero".to_string());
        }

        let recognition = self.recognition();
        if recognition.resolve_api_key().is_none() {
            warnings.push("Recognition backend has no API key configured".to_string());
        }
        if recognition.version != RECOGNITION_CONFIG_VERSION {
            errors.push(format!(
                "Unsupported recognition config version {} (expected {})",
                recognition.version, RECOGNITION_CONFIG_VERSION
            ));
        }
        if recognition.sample_rate == 0 || recognition.channels == 0 {
            errors.push("Recognition sample_rate and channels must be non-zero".to_string());
        }

        let generation = self.generation();
        if generation.resolve_api_key().is_none() {
            warnings.push(format!(
                "Generation provider '{}' has no API key configured",
                generation.provider
            ));
        }
        if !matches!(generation.provider.as_str(), "groq" | "openai") {
            errors.push(format!(
                "Unknown generation provider: {}",
                generation.provider
            ));
        }
        if generation.timeout_secs == 0 {
            errors.push("Generation timeout_secs must be non-zero".to_string());
        }

        let synthesis = self.synthesis();
        if synthesis.resolve_api_key().is_none() {
            warnings.push("Synthesis backend has no API key configured".to_string());
        }
        if synthesis.timeout_secs == 0 {
            errors.push("Synthesis timeout_secs must be non-zero".to_string());
        }
        if synthesis.sample_rate == 0 {
            errors.push("Synthesis sample_rate must be non-zero".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
