use crate::core::error::PipelineError;
use crate::services::speech::{SpeechPayload, SpeechProvider, VoiceParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SystemSpeechConfig {
    /// Synthesizer binary; `say` on macOS and `espeak-ng` elsewhere when unset.
    #[serde(default)]
    pub command: Option<String>,
}

/// Speaks through the local synthesizer. Output goes to the speakers only.
pub struct SystemSpeechClient {
    config: SystemSpeechConfig,
}

impl SystemSpeechClient {
    pub fn new(config: SystemSpeechConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> String {
        self.config.command.clone().unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                "say".to_string()
            } else {
                "espeak-ng".to_string()
            }
        })
    }

    fn args(&self, program: &str, text: &str, language: &str, params: &VoiceParams) -> Vec<String> {
        let mut args = Vec::new();
        if program.ends_with("say") {
            if let Some(v) = &params.system_voice {
                args.push("-v".to_string());
                args.push(v.clone());
            }
        } else {
            // espeak-ng voices are lowercase language tags.
            let voice = params
                .system_voice
                .clone()
                .unwrap_or_else(|| language.to_lowercase());
            args.push("-v".to_string());
            args.push(voice);
        }
        // Narration that starts with `-` must not be read as an option.
        args.push("--".to_string());
        args.push(text.to_string());
        args
    }
}

#[async_trait]
impl SpeechProvider for SystemSpeechClient {
    async fn generate_speech(
        &self,
        text: &str,
        language: &str,
        params: &VoiceParams,
    ) -> Result<SpeechPayload, PipelineError> {
        let program = self.program();
        let status = Command::new(&program)
            .args(self.args(&program, text, language, params))
            .status()
            .await
            .map_err(|e| PipelineError::provider(format!("Failed to run {}: {}", program, e)))?;

        if !status.success() {
            return Err(PipelineError::provider(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(SpeechPayload::PlayedLocally)
    }

    fn min_call_spacing(&self) -> Duration {
        Duration::ZERO
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_espeak_arguments() {
        let client = SystemSpeechClient::new(SystemSpeechConfig {
            command: Some("espeak-ng".to_string()),
        });
        let args = client.args("espeak-ng", "hello", "en-US", &VoiceParams::default());
        assert_eq!(args, vec!["-v", "en-us", "--", "hello"]);
    }

    #[test]
    fn test_say_uses_explicit_voice_only() {
        let client = SystemSpeechClient::new(SystemSpeechConfig::default());
        let bare = client.args("say", "hi", "en-US", &VoiceParams::default());
        assert_eq!(bare, vec!["--", "hi"]);

        let params = VoiceParams {
            system_voice: Some("Samantha".to_string()),
            ..Default::default()
        };
        assert_eq!(client.args("/usr/bin/say", "hi", "en-US", &params), vec!["-v", "Samantha", "--", "hi"]);
    }

    #[test]
    fn test_dash_leading_narration_stays_an_operand() {
        let client = SystemSpeechClient::new(SystemSpeechConfig::default());
        let args = client.args("espeak-ng", "-w /tmp/x.wav", "en-US", &VoiceParams::default());
        assert_eq!(args, vec!["-v", "en-us", "--", "-w /tmp/x.wav"]);
        let dashes = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args.last().unwrap(), "-w /tmp/x.wav");
        assert_eq!(dashes, args.len() - 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_provider_error() {
        let client = SystemSpeechClient::new(SystemSpeechConfig {
            command: Some("definitely-not-a-real-tts-binary".to_string()),
        });
        let err = client
            .generate_speech("hi", "en-US", &VoiceParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-tts-binary"));
        assert!(!err.is_rate_limited());
    }
}
