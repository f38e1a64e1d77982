use crate::core::error::PipelineError;
use crate::services::image::error_from_response;
use crate::services::image::gemini::{default_base_url, generate_content_url, GenerateContentResponse};
use crate::services::speech::{SpeechPayload, SpeechProvider, VoiceParams};
use crate::services::vault::KeyRing;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SAMPLE_RATE: u32 = 24000;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiSpeechConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

impl Default for GeminiSpeechConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    contents: Vec<TtsContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: TtsGenerationConfig,
}

#[derive(Serialize)]
struct TtsContent<'a> {
    parts: Vec<TtsPart<'a>>,
}

#[derive(Serialize)]
struct TtsPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TtsGenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfigBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfigBody {
    voice_config: VoiceConfigBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfigBody {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: &'static str,
}

fn build_request<'a>(text: &'a str, params: &VoiceParams) -> TtsRequest<'a> {
    TtsRequest {
        contents: vec![TtsContent {
            parts: vec![TtsPart { text }],
        }],
        generation_config: TtsGenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfigBody {
                voice_config: VoiceConfigBody {
                    prebuilt_voice_config: PrebuiltVoice {
                        voice_name: params.voice.as_str(),
                    },
                },
            },
        },
    }
}

/// Reads `rate=NNNN` from a mime type such as `audio/L16;codec=pcm;rate=24000`.
fn sample_rate_from_mime(mime: Option<&str>) -> u32 {
    mime.and_then(|m| {
        m.split(';')
            .filter_map(|p| p.trim().strip_prefix("rate="))
            .find_map(|r| r.parse().ok().filter(|rate: &u32| *rate > 0))
    })
    .unwrap_or(DEFAULT_SAMPLE_RATE)
}

fn parse_speech_response(body: &str) -> Result<SpeechPayload, PipelineError> {
    let response: GenerateContentResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::provider(format!("Failed to parse Gemini TTS response: {}", e))
    })?;
    let inline = response.into_inline_data()?;
    let data = STANDARD
        .decode(inline.data.trim())
        .map_err(|e| PipelineError::provider(format!("Invalid base64 audio data: {}", e)))?;
    Ok(SpeechPayload::Pcm16 {
        data,
        sample_rate: sample_rate_from_mime(inline.mime_type.as_deref()),
    })
}

pub struct GeminiSpeechClient {
    config: GeminiSpeechConfig,
    keys: KeyRing,
    client: reqwest::Client,
}

impl GeminiSpeechClient {
    pub fn new(config: GeminiSpeechConfig, keys: KeyRing) -> Self {
        Self {
            config,
            keys,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SpeechProvider for GeminiSpeechClient {
    async fn generate_speech(
        &self,
        text: &str,
        _language: &str,
        params: &VoiceParams,
    ) -> Result<SpeechPayload, PipelineError> {
        let api_key = self.keys.acquire()?;
        let url = generate_content_url(&self.config.base_url, &self.config.model, &api_key)?;

        let resp = self
            .client
            .post(url)
            .json(&build_request(text, params))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body = resp.text().await?;
        parse_speech_response(&body)
    }

    fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(6500)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
