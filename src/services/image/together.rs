use crate::core::error::PipelineError;
use crate::core::state::{AspectRatio, ImageAsset};
use crate::services::image::{error_from_response, ImageProvider};
use crate::services::vault::KeyRing;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TogetherImageConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Long edge in pixels; the short edge follows the aspect ratio.
    #[serde(default = "default_long_edge")]
    pub long_edge: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_model() -> String {
    "black-forest-labs/FLUX.1-schnell".to_string()
}
fn default_endpoint() -> String {
    "https://api.together.xyz/v1/images/generations".to_string()
}
fn default_long_edge() -> u32 {
    1024
}
fn default_steps() -> u32 {
    4
}

impl Default for TogetherImageConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            endpoint: default_endpoint(),
            long_edge: default_long_edge(),
            steps: default_steps(),
        }
    }
}

impl TogetherImageConfig {
    /// (width, height), both rounded down to a multiple of 16.
    fn dimensions(&self, aspect_ratio: AspectRatio) -> (u32, u32) {
        let long = (self.long_edge / 16).max(1) * 16;
        let short = ((long * 9 / 16) / 16).max(1) * 16;
        if aspect_ratio.is_vertical() {
            (short, long)
        } else {
            (long, short)
        }
    }
}

#[derive(Serialize)]
struct TogetherRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    n: u32,
}

#[derive(Deserialize)]
struct TogetherResponse {
    #[serde(default)]
    data: Vec<TogetherImage>,
}

#[derive(Deserialize)]
struct TogetherImage {
    url: Option<String>,
    b64_json: Option<String>,
}

fn parse_image_response(body: &str) -> Result<ImageAsset, PipelineError> {
    let response: TogetherResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::provider(format!("Failed to parse Together response: {}. Body: {}", e, body))
    })?;
    let first = response
        .data
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::provider("Together response contained no images"))?;

    if let Some(url) = first.url.filter(|u| !u.is_empty()) {
        return Ok(ImageAsset::Url(url));
    }
    let b64 = first
        .b64_json
        .ok_or_else(|| PipelineError::provider("Together image had neither url nor b64_json"))?;
    let data = STANDARD
        .decode(b64.trim())
        .map_err(|e| PipelineError::provider(format!("Invalid base64 image data: {}", e)))?;
    Ok(ImageAsset::Bytes {
        data,
        mime: "image/jpeg".to_string(),
    })
}

pub struct TogetherImageClient {
    config: TogetherImageConfig,
    keys: KeyRing,
    client: reqwest::Client,
}

impl TogetherImageClient {
    pub fn new(config: TogetherImageConfig, keys: KeyRing) -> Self {
        Self {
            config,
            keys,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageProvider for TogetherImageClient {
    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageAsset, PipelineError> {
        let api_key = self.keys.acquire()?;
        let (width, height) = self.config.dimensions(aspect_ratio);
        let body = TogetherRequest {
            model: &self.config.model,
            prompt,
            width,
            height,
            steps: self.config.steps,
            n: 1,
        };

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let text = resp.text().await?;
        parse_image_response(&text)
    }

    fn name(&self) -> &'static str {
        "together"
    }
}
