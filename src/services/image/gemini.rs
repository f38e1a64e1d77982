use crate::core::error::PipelineError;
use crate::core::state::{AspectRatio, ImageAsset};
use crate::services::image::{error_from_response, ImageProvider};
use crate::services::vault::KeyRing;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiImageConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

pub(crate) fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

impl Default for GeminiImageConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
        }
    }
}

/// `{base}/v1beta/models/{model}:generateContent?key=...`
pub(crate) fn generate_content_url(
    base_url: &str,
    model: &str,
    api_key: &str,
) -> Result<Url, PipelineError> {
    let raw = format!(
        "{}/v1beta/models/{}:generateContent",
        base_url.trim_end_matches('/'),
        model
    );
    let mut url = Url::parse(&raw)
        .map_err(|e| PipelineError::provider(format!("Invalid Gemini URL {}: {}", raw, e)))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

#[derive(Serialize)]
struct GeminiImageRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "imageConfig")]
    image_config: ImageGenerationConfig,
}

#[derive(Serialize)]
struct ImageGenerationConfig {
    #[serde(rename = "aspectRatio")]
    aspect_ratio: &'static str,
}

#[derive(Deserialize)]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
pub(crate) struct Candidate {
    pub content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
pub(crate) struct ResponsePart {
    #[serde(rename = "inlineData")]
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
pub(crate) struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub data: String,
}

impl GenerateContentResponse {
    /// First inline payload of the first candidate.
    pub(crate) fn into_inline_data(self) -> Result<InlineData, PipelineError> {
        let first = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::provider("Gemini response contained no candidates"))?;
        let reason = first.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        first
            .content
            .into_iter()
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data)
            .ok_or_else(|| {
                PipelineError::provider(format!(
                    "Gemini response had no inline data. Finish reason: {}",
                    reason
                ))
            })
    }
}

fn parse_image_response(body: &str) -> Result<ImageAsset, PipelineError> {
    let response: GenerateContentResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::provider(format!("Failed to parse Gemini response: {}. Body: {}", e, body))
    })?;
    let inline = response.into_inline_data()?;
    let data = STANDARD
        .decode(inline.data.trim())
        .map_err(|e| PipelineError::provider(format!("Invalid base64 image data: {}", e)))?;
    Ok(ImageAsset::Bytes {
        data,
        mime: inline.mime_type.unwrap_or_else(|| "image/png".to_string()),
    })
}

pub struct GeminiImageClient {
    config: GeminiImageConfig,
    keys: KeyRing,
    client: reqwest::Client,
}

impl GeminiImageClient {
    pub fn new(config: GeminiImageConfig, keys: KeyRing) -> Self {
        Self {
            config,
            keys,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageProvider for GeminiImageClient {
    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageAsset, PipelineError> {
        let api_key = self.keys.acquire()?;
        let url = generate_content_url(&self.config.base_url, &self.config.model, &api_key)?;

        let body = GeminiImageRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                image_config: ImageGenerationConfig {
                    aspect_ratio: aspect_ratio.as_str(),
                },
            },
        };

        let resp = self.client.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let text = resp.text().await?;
        parse_image_response(&text)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
