//! Image collaborators — captioning inbound attachments and generating images for replies.

pub mod huggingface;
pub mod rate_limit;

pub use huggingface::{HuggingFaceClient, HuggingFaceConfig};
pub use rate_limit::RateLimiter;

use async_trait::async_trait;

use crate::channels::Attachment;
use crate::error::ExternalError;

/// Image bytes produced by a generator.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl GeneratedImage {
    /// Wrap as an email attachment, choosing an extension from the MIME type.
    pub fn into_attachment(self, stem: &str) -> Attachment {
        let ext = match self.content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        };
        Attachment {
            filename: format!("{stem}.{ext}"),
            content_type: self.content_type,
            data: self.data,
        }
    }
}

/// Describes an image in one sentence. Service name: `captioner`.
#[async_trait]
pub trait ImageCaptioner: Send + Sync {
    async fn caption(&self, image: &[u8]) -> Result<String, ExternalError>;
}

/// Renders an image from a text prompt. Service name: `image-generator`.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ExternalError>;
}
