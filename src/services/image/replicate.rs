use crate::core::error::PipelineError;
use crate::core::state::{AspectRatio, ImageAsset};
use crate::services::image::{error_from_response, ImageProvider};
use crate::services::vault::KeyRing;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplicateImageConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Pause between status checks while a prediction is still running.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_model() -> String {
    "black-forest-labs/flux-schnell".to_string()
}
fn default_base_url() -> String {
    "https://api.replicate.com".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_polls() -> u32 {
    60
}

impl Default for ReplicateImageConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

#[derive(Serialize)]
struct PredictionRequest<'a> {
    input: PredictionInput<'a>,
}

#[derive(Serialize)]
struct PredictionInput<'a> {
    prompt: &'a str,
    aspect_ratio: &'static str,
}

#[derive(Deserialize)]
struct Prediction {
    status: Option<String>,
    #[serde(default)]
    output: Value,
    error: Option<Value>,
    urls: Option<PredictionUrls>,
}

#[derive(Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

#[derive(Debug, PartialEq)]
enum PredictionState {
    Done(ImageAsset),
    Running { status: String, poll_url: String },
}

/// flux-schnell answers with a list of file URLs; some models return a bare string.
fn parse_prediction(body: &str) -> Result<PredictionState, PipelineError> {
    let prediction: Prediction = serde_json::from_str(body).map_err(|e| {
        PipelineError::provider(format!("Failed to parse Replicate response: {}. Body: {}", e, body))
    })?;

    if let Some(err) = prediction.error.filter(|e| !e.is_null()) {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(PipelineError::provider(message));
    }

    let url = match &prediction.output {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    };
    if let Some(url) = url {
        return Ok(PredictionState::Done(ImageAsset::Url(url)));
    }

    let status = prediction.status.unwrap_or_else(|| "unknown".to_string());
    if !matches!(status.as_str(), "starting" | "processing") {
        return Err(PipelineError::provider(format!(
            "Replicate generation failed (status: {})",
            status
        )));
    }
    let poll_url = prediction.urls.and_then(|u| u.get).ok_or_else(|| {
        PipelineError::provider(format!(
            "Replicate prediction is {} but has no status URL",
            status
        ))
    })?;
    Ok(PredictionState::Running { status, poll_url })
}

/// Re-fetches a running prediction until it finishes or `max_polls` runs out.
async fn await_prediction<F, Fut>(
    mut state: PredictionState,
    interval: Duration,
    max_polls: u32,
    mut fetch: F,
) -> Result<ImageAsset, PipelineError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String, PipelineError>>,
{
    let mut polls = 0;
    loop {
        match state {
            PredictionState::Done(asset) => return Ok(asset),
            PredictionState::Running { status, poll_url } => {
                if polls >= max_polls {
                    return Err(PipelineError::provider(format!(
                        "Replicate prediction still {} after {} status checks",
                        status, polls
                    )));
                }
                polls += 1;
                debug!("Replicate prediction {}, checking again ({}/{})", status, polls, max_polls);
                tokio::time::sleep(interval).await;
                state = parse_prediction(&fetch(poll_url).await?)?;
            }
        }
    }
}

pub struct ReplicateImageClient {
    config: ReplicateImageConfig,
    keys: KeyRing,
    client: reqwest::Client,
}

impl ReplicateImageClient {
    pub fn new(config: ReplicateImageConfig, keys: KeyRing) -> Self {
        Self {
            config,
            keys,
            client: reqwest::Client::new(),
        }
    }

    fn predictions_url(&self) -> String {
        format!(
            "{}/v1/models/{}/predictions",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn fetch_prediction(&self, url: String, token: &str) -> Result<String, PipelineError> {
        let resp = self.client.get(url).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl ImageProvider for ReplicateImageClient {
    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageAsset, PipelineError> {
        let token = self.keys.acquire()?;
        let body = PredictionRequest {
            input: PredictionInput {
                prompt,
                aspect_ratio: aspect_ratio.as_str(),
            },
        };
        debug!("Generating image with Replicate ({}): {}", aspect_ratio, prompt);

        // `Prefer: wait` usually returns a finished prediction; slower runs are polled.
        let resp = self
            .client
            .post(self.predictions_url())
            .bearer_auth(&token)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let state = parse_prediction(&resp.text().await?)?;

        await_prediction(
            state,
            Duration::from_millis(self.config.poll_interval_ms),
            self.config.max_polls,
            |url| self.fetch_prediction(url, &token),
        )
        .await
    }

    fn name(&self) -> &'static str {
        "replicate"
    }
}
