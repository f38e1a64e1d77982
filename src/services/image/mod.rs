use crate::core::config::RetryConfig;
use crate::core::error::{PipelineError, Provider};
use crate::core::state::{AspectRatio, ImageAsset};
use crate::services::vault::{CredentialVault, KeyRing};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod gemini;
pub mod replicate;
pub mod together;

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageAsset, PipelineError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEngine {
    #[default]
    Gemini,
    Together,
    Replicate,
}

impl ImageEngine {
    pub const ALL: [ImageEngine; 3] = [ImageEngine::Gemini, ImageEngine::Together, ImageEngine::Replicate];

    pub fn provider(&self) -> Provider {
        match self {
            ImageEngine::Gemini => Provider::Gemini,
            ImageEngine::Together => Provider::Together,
            ImageEngine::Replicate => Provider::Replicate,
        }
    }
}

impl fmt::Display for ImageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageEngine::Gemini => "Gemini (gemini-2.5-flash-image)",
            ImageEngine::Together => "Together (FLUX.1-schnell)",
            ImageEngine::Replicate => "Replicate (flux-schnell)",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default)]
    pub engine: ImageEngine,

    /// Prepended to every image prompt.
    #[serde(default = "default_style_preamble")]
    pub style_preamble: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub gemini: gemini::GeminiImageConfig,

    #[serde(default)]
    pub together: together::TogetherImageConfig,

    #[serde(default)]
    pub replicate: replicate::ReplicateImageConfig,
}

fn default_style_preamble() -> String {
    "Pixar style. ".to_string()
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            engine: ImageEngine::default(),
            style_preamble: default_style_preamble(),
            retry: RetryConfig::default(),
            gemini: Default::default(),
            together: Default::default(),
            replicate: Default::default(),
        }
    }
}

pub fn create_image_provider(
    config: &ImageConfig,
    vault: Arc<CredentialVault>,
) -> Box<dyn ImageProvider> {
    info!("Initializing image provider: {}", config.engine);
    let keys = KeyRing::new(vault, config.engine.provider());
    match config.engine {
        ImageEngine::Gemini => Box::new(gemini::GeminiImageClient::new(
            config.gemini.clone(),
            keys,
        )),
        ImageEngine::Together => Box::new(together::TogetherImageClient::new(
            config.together.clone(),
            keys,
        )),
        ImageEngine::Replicate => Box::new(replicate::ReplicateImageClient::new(
            config.replicate.clone(),
            keys,
        )),
    }
}

/// Reads a non-success response into a classified error.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> PipelineError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    PipelineError::from_response(status, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_maps_to_vault_provider() {
        assert_eq!(ImageEngine::Gemini.provider(), Provider::Gemini);
        assert_eq!(ImageEngine::Together.provider(), Provider::Together);
        assert_eq!(ImageEngine::Replicate.provider(), Provider::Replicate);
    }

    #[test]
    fn test_factory_picks_configured_engine() {
        let vault = Arc::new(CredentialVault::new());
        for engine in ImageEngine::ALL {
            let config = ImageConfig {
                engine,
                ..Default::default()
            };
            let provider = create_image_provider(&config, vault.clone());
            assert_eq!(provider.name(), engine.provider().as_str());
        }
    }
}
