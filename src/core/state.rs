use crate::core::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    pub description: String,
}

/// Output orientation requested from the image provider.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Vertical,
}

impl AspectRatio {
    /// Scans a prompt for orientation markers; anything else is landscape.
    pub fn infer(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        if lower.contains("9:16") || lower.contains("vertical") {
            AspectRatio::Vertical
        } else {
            AspectRatio::Landscape
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Vertical => "9:16",
        }
    }

    pub fn is_vertical(&self) -> bool {
        matches!(self, AspectRatio::Vertical)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image produced for a scene: either the bytes themselves or a reference to fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ImageAsset {
    Bytes { data: Vec<u8>, mime: String },
    Url(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Scene {
    pub id: usize,
    pub image_prompt: String,
    pub narrator_text: String,
    pub translations: BTreeMap<String, String>,
    #[serde(default)]
    pub image: Option<ImageAsset>,
    /// Language code -> WAV container bytes.
    #[serde(default)]
    pub audio: BTreeMap<String, Vec<u8>>,
}

impl Scene {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_narration_complete(&self, language: &str) -> bool {
        self.translations.contains_key(language)
    }

    pub fn is_fully_produced(&self, languages: &[String]) -> bool {
        self.image.is_some()
            && languages
                .iter()
                .all(|l| self.is_narration_complete(l) && self.audio.contains_key(l))
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        AspectRatio::infer(&self.image_prompt)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Parsing,
    Imaging,
    Synthesizing,
    Ready,
    Exporting,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Parsing => "parsing",
            Phase::Imaging => "imaging",
            Phase::Synthesizing => "synthesizing",
            Phase::Ready => "ready",
            Phase::Exporting => "exporting",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProductionState {
    pub script: String,
    pub scenes: Vec<Scene>,
    pub characters: Vec<Character>,
    pub target_languages: Vec<String>,
    phase: Phase,
    pub error: Option<String>,
}

impl ProductionState {
    pub fn new(script: impl Into<String>, target_languages: Vec<String>) -> Self {
        let mut languages: Vec<String> = Vec::with_capacity(target_languages.len());
        for lang in target_languages {
            if !languages.contains(&lang) {
                languages.push(lang);
            }
        }
        Self {
            script: script.into(),
            scenes: Vec::new(),
            characters: Vec::new(),
            target_languages: languages,
            phase: Phase::Idle,
            error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves strictly forward. `Exporting -> Ready` is the only step back, so a
    /// finished production can be exported again.
    pub fn advance(&mut self, next: Phase) -> Result<(), PipelineError> {
        let allowed = match (self.phase, next) {
            (Phase::Failed, _) | (_, Phase::Failed) => false,
            (Phase::Exporting, Phase::Ready) => true,
            (from, to) => to > from,
        };
        if !allowed {
            return Err(PipelineError::InvalidPhase {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Records a fatal error. Returns false if the production was already failed.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.phase == Phase::Failed {
            return false;
        }
        self.phase = Phase::Failed;
        self.error = Some(message.into());
        true
    }

    /// Returns to idle so the whole pipeline can run again.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.error = None;
    }
}
