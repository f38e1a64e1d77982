use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::progress::{ProgressEvent, ProgressObserver};
use crate::core::state::{Character, Phase, ProductionState};
use crate::services::image::ImageProvider;
use crate::services::retry::{RetryController, RetryPolicy};
use crate::services::script;
use crate::services::speech::{SpeechPayload, SpeechProvider, VoiceParams};
use crate::utils::audio::pcm16_to_wav;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Builds the prompt sent to the image provider for one scene.
pub fn compose_image_prompt(style: &str, characters: &[Character], scene_prompt: &str) -> String {
    let mut prompt = String::from(style);
    if !characters.is_empty() {
        prompt.push_str("Character Bible:\n");
        for c in characters {
            prompt.push_str(&format!("- {}: {}\n", c.name, c.description));
        }
        prompt.push_str("\nScene Description: ");
    }
    prompt.push_str(scene_prompt);
    prompt
}

/// Drives a production from raw script to scenes with images and narration.
pub struct ProductionManager {
    image: Box<dyn ImageProvider>,
    speech: Box<dyn SpeechProvider>,
    retry: RetryController,
    observer: Arc<dyn ProgressObserver>,
    style_preamble: String,
    image_policy: RetryPolicy,
    speech_policy: RetryPolicy,
    voice: VoiceParams,
    speech_spacing: Duration,
    last_speech_call: Option<Instant>,
}

impl ProductionManager {
    pub fn new(
        config: &Config,
        image: Box<dyn ImageProvider>,
        speech: Box<dyn SpeechProvider>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        let speech_spacing = config.speech.pacing_for(speech.as_ref());
        Self {
            retry: RetryController::new(observer.clone()),
            style_preamble: config.image.style_preamble.clone(),
            image_policy: config.image.retry.policy(),
            speech_policy: config.speech.retry.policy(),
            voice: config.speech.voice_params(),
            speech_spacing,
            last_speech_call: None,
            image,
            speech,
            observer,
        }
    }

    /// Runs parsing, imaging and synthesis. The production must be idle.
    ///
    /// On a fatal error the state is marked failed with the original message
    /// and the error is returned.
    pub async fn run(&mut self, state: &mut ProductionState) -> Result<(), PipelineError> {
        if state.phase() != Phase::Idle {
            return Err(PipelineError::InvalidPhase {
                from: state.phase().to_string(),
                to: Phase::Parsing.to_string(),
            });
        }

        match self.produce(state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Production failed: {}", e);
                state.fail(e.to_string());
                self.observer.notify(ProgressEvent::Phase(Phase::Failed));
                Err(e)
            }
        }
    }

    fn enter(&self, state: &mut ProductionState, phase: Phase) -> Result<(), PipelineError> {
        state.advance(phase)?;
        info!("Production phase: {}", phase);
        self.observer.notify(ProgressEvent::Phase(phase));
        Ok(())
    }

    async fn produce(&mut self, state: &mut ProductionState) -> Result<(), PipelineError> {
        self.enter(state, Phase::Parsing)?;
        let parsed = script::parse(&state.script)?;
        info!(
            "Parsed {} scenes and {} characters",
            parsed.scenes.len(),
            parsed.characters.len()
        );
        state.scenes = parsed.scenes;
        state.characters = parsed.characters;

        self.enter(state, Phase::Imaging)?;
        self.generate_images(state).await?;

        self.enter(state, Phase::Synthesizing)?;
        self.synthesize_narration(state).await;

        self.enter(state, Phase::Ready)?;
        Ok(())
    }

    async fn generate_images(&self, state: &mut ProductionState) -> Result<(), PipelineError> {
        let total = state.scenes.len();
        for i in 0..total {
            let scene = &state.scenes[i];
            let prompt =
                compose_image_prompt(&self.style_preamble, &state.characters, &scene.image_prompt);
            let aspect_ratio = scene.aspect_ratio();
            let context = format!("Image Generation {}", i + 1);

            let image = self.image.as_ref();
            let prompt = prompt.as_str();
            let asset = self
                .retry
                .run(
                    move || image.generate_image(prompt, aspect_ratio),
                    self.image_policy,
                    &context,
                )
                .await?;

            state.scenes[i].image = Some(asset);
            self.observer
                .notify(ProgressEvent::SceneImaged { index: i, total });
        }
        Ok(())
    }

    /// Sleeps until the configured spacing since the previous speech call has passed.
    async fn pace_speech(&self) {
        if let Some(last) = self.last_speech_call {
            let elapsed = last.elapsed();
            if elapsed < self.speech_spacing {
                tokio::time::sleep(self.speech_spacing - elapsed).await;
            }
        }
    }

    /// Failures are logged and skipped per (scene, language).
    async fn synthesize_narration(&mut self, state: &mut ProductionState) {
        let total = state.scenes.len();
        let languages = state.target_languages.clone();

        for i in 0..total {
            for lang in &languages {
                let text = match state.scenes[i].translations.get(lang) {
                    Some(t) if !t.trim().is_empty() => t.clone(),
                    _ => continue,
                };

                self.pace_speech().await;
                self.observer.notify(ProgressEvent::Status(format!(
                    "{} Synthesis: Processing {}...",
                    self.speech.name(),
                    lang
                )));

                let context = format!("TTS Synthesis ({})", lang);
                let speech = self.speech.as_ref();
                let voice = &self.voice;
                let text = text.as_str();
                let result = self
                    .retry
                    .run(
                        move || speech.generate_speech(text, lang, voice),
                        self.speech_policy,
                        &context,
                    )
                    .await;
                self.last_speech_call = Some(Instant::now());

                match result {
                    Ok(SpeechPayload::Pcm16 { data, sample_rate }) => {
                        state.scenes[i]
                            .audio
                            .insert(lang.clone(), pcm16_to_wav(&data, sample_rate));
                    }
                    Ok(SpeechPayload::Encoded(bytes)) => {
                        state.scenes[i].audio.insert(lang.clone(), bytes);
                    }
                    Ok(SpeechPayload::PlayedLocally) => {
                        warn!("Scene {} {} was played locally and will not be exported", i + 1, lang);
                    }
                    Err(e) => error!("Failed TTS for {} (scene {}): {}", lang, i + 1, e),
                }
            }
            self.observer
                .notify(ProgressEvent::SceneSynthesized { index: i, total });
        }
    }
}
