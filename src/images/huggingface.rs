//! Hugging Face inference API — BLIP captioning and FLUX image generation.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ExternalError;
use crate::images::{GeneratedImage, ImageCaptioner, ImageGenerator};

const CAPTION_SERVICE: &str = "captioner";
const GENERATE_SERVICE: &str = "image-generator";

pub const DEFAULT_BASE_URL: &str = "https://router.huggingface.co/hf-inference/models";
pub const DEFAULT_CAPTION_MODEL: &str = "Salesforce/blip-image-captioning-base";
pub const DEFAULT_IMAGE_MODEL: &str = "black-forest-labs/FLUX.1-schnell";

/// Inference endpoint configuration.
#[derive(Debug, Clone)]
pub struct HuggingFaceConfig {
    /// Anonymous requests are sent when unset.
    pub api_token: Option<SecretString>,
    pub base_url: String,
    pub caption_model: String,
    pub image_model: String,
}

impl HuggingFaceConfig {
    /// Build config from `HF_API_TOKEN` and `HF_BASE_URL`.
    pub fn from_env() -> Self {
        Self {
            api_token: std::env::var("HF_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            base_url: std::env::var("HF_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            caption_model: DEFAULT_CAPTION_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CaptionEntry {
    generated_text: String,
}

/// Pull the caption out of a BLIP response body.
fn parse_caption(body: &str) -> Result<String, ExternalError> {
    let entries: Vec<CaptionEntry> = serde_json::from_str(body)
        .map_err(|e| ExternalError::invalid(CAPTION_SERVICE, e.to_string()))?;
    let caption = entries
        .into_iter()
        .map(|e| e.generated_text.trim().to_string())
        .find(|t| !t.is_empty())
        .ok_or_else(|| ExternalError::invalid(CAPTION_SERVICE, "empty caption"))?;

    let mut chars = caption.chars();
    Ok(match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => caption,
    })
}

/// Client for both image collaborators.
pub struct HuggingFaceClient {
    client: reqwest::Client,
    config: HuggingFaceConfig,
}

impl HuggingFaceClient {
    pub fn new(config: HuggingFaceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn model_url(&self, model: &str) -> String {
        format!("{}/{}", self.config.base_url, model)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl ImageCaptioner for HuggingFaceClient {
    async fn caption(&self, image: &[u8]) -> Result<String, ExternalError> {
        let response = self
            .authorize(self.client.post(self.model_url(&self.config.caption_model)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| ExternalError::request(CAPTION_SERVICE, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExternalError::request(CAPTION_SERVICE, e.to_string()))?;
        if !status.is_success() {
            return Err(ExternalError::request(
                CAPTION_SERVICE,
                format!("HTTP {status}: {body}"),
            ));
        }

        let caption = parse_caption(&body)?;
        tracing::debug!(caption = %caption, "Image captioned");
        Ok(caption)
    }
}

#[async_trait]
impl ImageGenerator for HuggingFaceClient {
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ExternalError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ExternalError::request(GENERATE_SERVICE, "empty prompt"));
        }

        let response = self
            .authorize(self.client.post(self.model_url(&self.config.image_model)))
            .json(&serde_json::json!({
                "inputs": prompt,
                "parameters": { "width": 512, "height": 512 },
            }))
            .send()
            .await
            .map_err(|e| ExternalError::request(GENERATE_SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalError::request(
                GENERATE_SERVICE,
                format!("HTTP {status}: {text}"),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
            .unwrap_or_else(|| "image/png".to_string());
        if !content_type.starts_with("image/") {
            return Err(ExternalError::invalid(
                GENERATE_SERVICE,
                format!("expected image, got {content_type}"),
            ));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| ExternalError::request(GENERATE_SERVICE, e.to_string()))?
            .to_vec();

        tracing::info!(bytes = data.len(), model = %self.config.image_model, "Image generated");
        Ok(GeneratedImage { data, content_type })
    }
}
