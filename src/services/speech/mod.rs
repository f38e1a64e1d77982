use crate::core::config::RetryConfig;
use crate::core::error::{PipelineError, Provider};
use crate::services::vault::{CredentialVault, KeyRing};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod edge;
pub mod gemini;
pub mod system;

/// What a speech engine handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechPayload {
    /// Headerless 16-bit mono little-endian PCM.
    Pcm16 { data: Vec<u8>, sample_rate: u32 },
    /// Already containerised audio (WAV).
    Encoded(Vec<u8>),
    /// Spoken through the local audio device; nothing to keep.
    PlayedLocally,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceName {
    #[default]
    Kore,
    Puck,
    Charon,
    Fenrir,
    Zephyr,
}

impl VoiceName {
    pub const ALL: [VoiceName; 5] = [
        VoiceName::Kore,
        VoiceName::Zephyr,
        VoiceName::Puck,
        VoiceName::Charon,
        VoiceName::Fenrir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceName::Kore => "Kore",
            VoiceName::Puck => "Puck",
            VoiceName::Charon => "Charon",
            VoiceName::Fenrir => "Fenrir",
            VoiceName::Zephyr => "Zephyr",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            VoiceName::Kore => "Bright, professional, and clear",
            VoiceName::Zephyr => "Soft, cinematic, and breathy",
            VoiceName::Puck => "Youthful, friendly, and energetic",
            VoiceName::Charon => "Deep, authoritative, and steady",
            VoiceName::Fenrir => "Mellow, calm, and soothing",
        }
    }

    pub fn is_female(&self) -> bool {
        matches!(self, VoiceName::Kore | VoiceName::Zephyr)
    }
}

impl fmt::Display for VoiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gender = if self.is_female() { "Female" } else { "Male" };
        write!(f, "{} ({}, {})", self.as_str(), gender, self.description())
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoiceParams {
    pub voice: VoiceName,
    /// Voice name handed to the local synthesizer, if any.
    pub system_voice: Option<String>,
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn generate_speech(
        &self,
        text: &str,
        language: &str,
        params: &VoiceParams,
    ) -> Result<SpeechPayload, PipelineError>;

    /// Minimum gap between the end of one call and the start of the next.
    fn min_call_spacing(&self) -> Duration;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechEngine {
    Gemini,
    #[default]
    Edge,
    System,
}

impl SpeechEngine {
    pub const ALL: [SpeechEngine; 3] = [SpeechEngine::Edge, SpeechEngine::Gemini, SpeechEngine::System];
}

impl fmt::Display for SpeechEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpeechEngine::Gemini => "Gemini TTS",
            SpeechEngine::Edge => "Edge TTS (free)",
            SpeechEngine::System => "System voice (plays locally, not exported)",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default)]
    pub engine: SpeechEngine,

    #[serde(default)]
    pub voice: VoiceName,

    #[serde(default)]
    pub system_voice: Option<String>,

    /// Overrides the engine's own spacing between calls.
    #[serde(default)]
    pub pacing_ms: Option<u64>,

    #[serde(default = "default_speech_retry")]
    pub retry: RetryConfig,

    #[serde(default)]
    pub gemini: gemini::GeminiSpeechConfig,

    #[serde(default)]
    pub edge: edge::EdgeSpeechConfig,

    #[serde(default)]
    pub system: system::SystemSpeechConfig,
}

fn default_speech_retry() -> RetryConfig {
    RetryConfig::new(5, 5000)
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            engine: SpeechEngine::default(),
            voice: VoiceName::default(),
            system_voice: None,
            pacing_ms: None,
            retry: default_speech_retry(),
            gemini: Default::default(),
            edge: Default::default(),
            system: Default::default(),
        }
    }
}

impl SpeechConfig {
    pub fn voice_params(&self) -> VoiceParams {
        VoiceParams {
            voice: self.voice,
            system_voice: self.system_voice.clone(),
        }
    }

    /// Configured spacing, or the provider's own when unset.
    pub fn pacing_for(&self, provider: &dyn SpeechProvider) -> Duration {
        self.pacing_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| provider.min_call_spacing())
    }
}

pub fn create_speech_provider(
    config: &SpeechConfig,
    vault: Arc<CredentialVault>,
) -> Box<dyn SpeechProvider> {
    info!("Initializing speech provider: {}", config.engine);
    match config.engine {
        SpeechEngine::Gemini => Box::new(gemini::GeminiSpeechClient::new(
            config.gemini.clone(),
            KeyRing::new(vault, Provider::Gemini),
        )),
        SpeechEngine::Edge => Box::new(edge::EdgeSpeechClient::new(config.edge.clone())),
        SpeechEngine::System => Box::new(system::SystemSpeechClient::new(config.system.clone())),
    }
}
