use crate::core::error::PipelineError;
use crate::services::speech::{SpeechPayload, SpeechProvider, VoiceParams};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EdgeSpeechConfig {
    /// Language code -> Edge voice short name, overriding the built-in choice.
    #[serde(default)]
    pub voices: BTreeMap<String, String>,
}

/// Built-in neural voices per language as (female, male).
fn builtin_voices(language: &str) -> Option<(&'static str, &'static str)> {
    match language {
        "bn-BD" => Some(("bn-BD-NabanitaNeural", "bn-BD-PradeepNeural")),
        "hi-IN" => Some(("hi-IN-SwaraNeural", "hi-IN-MadhurNeural")),
        "en-US" => Some(("en-US-AriaNeural", "en-US-GuyNeural")),
        _ => None,
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub struct EdgeSpeechClient {
    config: EdgeSpeechConfig,
}

impl EdgeSpeechClient {
    pub fn new(config: EdgeSpeechConfig) -> Self {
        Self { config }
    }

    fn resolve_voice(&self, language: &str, params: &VoiceParams) -> Result<String, PipelineError> {
        if let Some(v) = self.config.voices.get(language) {
            return Ok(v.clone());
        }
        let (female, male) = builtin_voices(language).ok_or_else(|| {
            PipelineError::provider(format!("No Edge voice configured for {}", language))
        })?;
        Ok(if params.voice.is_female() { female } else { male }.to_string())
    }

    fn build_ssml(&self, text: &str, language: &str, voice: &str) -> String {
        format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
            language,
            voice,
            escape_xml(text)
        )
    }
}

#[async_trait]
impl SpeechProvider for EdgeSpeechClient {
    async fn generate_speech(
        &self,
        text: &str,
        language: &str,
        params: &VoiceParams,
    ) -> Result<SpeechPayload, PipelineError> {
        let voice = self.resolve_voice(language, params)?;
        debug!("Edge TTS {} with {}", language, voice);
        let ssml = self.build_ssml(text, language, &voice);

        let audio = tokio::task::spawn_blocking(move || {
            edge_tts::request_audio(&ssml, OUTPUT_FORMAT)
                .map_err(|e| PipelineError::provider(format!("Edge TTS crate error: {:?}", e)))
        })
        .await
        .map_err(|e| PipelineError::provider(format!("Edge TTS task failed: {}", e)))??;

        if audio.is_empty() {
            return Err(PipelineError::provider("Edge TTS returned no audio"));
        }
        Ok(SpeechPayload::Encoded(audio))
    }

    fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn name(&self) -> &'static str {
        "edge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::speech::VoiceName;

    fn params(voice: VoiceName) -> VoiceParams {
        VoiceParams {
            voice,
            system_voice: None,
        }
    }

    #[test]
    fn test_voice_follows_gender_and_language() {
        let client = EdgeSpeechClient::new(EdgeSpeechConfig::default());
        assert_eq!(
            client.resolve_voice("hi-IN", &params(VoiceName::Kore)).unwrap(),
            "hi-IN-SwaraNeural"
        );
        assert_eq!(
            client.resolve_voice("bn-BD", &params(VoiceName::Puck)).unwrap(),
            "bn-BD-PradeepNeural"
        );
        assert!(client.resolve_voice("fr-FR", &params(VoiceName::Kore)).is_err());
    }

    #[test]
    fn test_configured_voice_wins() {
        let mut voices = BTreeMap::new();
        voices.insert("fr-FR".to_string(), "fr-FR-DeniseNeural".to_string());
        let client = EdgeSpeechClient::new(EdgeSpeechConfig { voices });
        assert_eq!(
            client.resolve_voice("fr-FR", &params(VoiceName::Charon)).unwrap(),
            "fr-FR-DeniseNeural"
        );
    }

    #[test]
    fn test_ssml_escapes_text() {
        let client = EdgeSpeechClient::new(EdgeSpeechConfig::default());
        let ssml = client.build_ssml("Tom & <Jerry>", "en-US", "en-US-GuyNeural");
        assert!(ssml.contains("xml:lang='en-US'"));
        assert!(ssml.contains("<voice name='en-US-GuyNeural'>Tom &amp; &lt;Jerry&gt;</voice>"));
    }
}
