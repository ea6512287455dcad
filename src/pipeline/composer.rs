//! Response composer — turns an admitted message into a reply.
//!
//! Steps: caption an image attachment (if any), prompt the LLM, then act on
//! an optional `[IMAGE: ...]` directive in its output. Caption and generation
//! failures are hard; the image directive is best effort.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::channels::email_types::{reply_subject, strip_quoted_text};
use crate::channels::{Attachment, InboundEmail};
use crate::error::{ComposeError, ComposeStage, ExternalError, with_timeout};
use crate::images::{ImageCaptioner, ImageGenerator, RateLimiter};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

static IMAGE_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[IMAGE:\s*([^\]]*)\]").expect("valid image directive regex"));

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, helpful assistant answering email. \
Reply to the message below in plain text, concisely, without a subject line. \
If a picture would genuinely help, add one line of the form [IMAGE: <short description>] \
and an image will be attached.";

/// Composer settings.
#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub system_prompt: String,
    pub max_tokens: u32,
    /// Body characters kept in the prompt.
    pub max_prompt_chars: usize,
    pub call_timeout: Duration,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: 512,
            max_prompt_chars: 4000,
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// A reply ready to send.
#[derive(Debug, Clone)]
pub struct ComposedReply {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Why a requested image was left out, if one was.
    pub image_skipped: Option<String>,
}

/// Split an image directive out of generated text.
///
/// Returns the text with every directive removed and the first non-empty
/// directive prompt.
pub fn extract_image_directive(text: &str) -> (String, Option<String>) {
    let prompt = IMAGE_DIRECTIVE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .find(|p| !p.is_empty());

    let stripped = IMAGE_DIRECTIVE.replace_all(text, "");
    let cleaned = stripped
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    (cleaned, prompt)
}

/// Builds replies from the LLM and image collaborators.
pub struct ResponseComposer {
    llm: Arc<dyn LlmProvider>,
    captioner: Arc<dyn ImageCaptioner>,
    generator: Arc<dyn ImageGenerator>,
    config: ComposerConfig,
}

impl ResponseComposer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        captioner: Arc<dyn ImageCaptioner>,
        generator: Arc<dyn ImageGenerator>,
        config: ComposerConfig,
    ) -> Self {
        Self {
            llm,
            captioner,
            generator,
            config,
        }
    }

    fn build_prompt(&self, message: &InboundEmail, caption: Option<&str>) -> String {
        let body: String = strip_quoted_text(&message.body)
            .chars()
            .take(self.config.max_prompt_chars)
            .collect();
        let mut prompt = format!("Subject: {}\n\n{}", message.subject, body);
        if let Some(caption) = caption {
            prompt.push_str(&format!("\n\n[Attached image: {caption}]"));
        }
        prompt
    }

    /// Compose a reply to `message`.
    ///
    /// `limiter` is consulted before any image generation; `now` positions
    /// the request in its window.
    pub async fn compose(
        &self,
        message: &InboundEmail,
        limiter: &mut RateLimiter,
        now: DateTime<Utc>,
    ) -> Result<ComposedReply, ComposeError> {
        let timeout = self.config.call_timeout;

        let caption = match message.first_image() {
            Some(image) => {
                let caption = with_timeout("captioner", timeout, self.captioner.caption(&image.data))
                    .await
                    .map_err(|cause| ComposeError {
                        stage: ComposeStage::Caption,
                        cause,
                    })?;
                debug!(message_id = %message.id, caption = %caption, "Attachment captioned");
                Some(caption)
            }
            None => None,
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(&self.config.system_prompt),
            ChatMessage::user(self.build_prompt(message, caption.as_deref())),
        ])
        .with_max_tokens(self.config.max_tokens)
        .with_temperature(0.7);

        let generate_err = |cause| ComposeError {
            stage: ComposeStage::Generate,
            cause,
        };
        let response = with_timeout("llm", timeout, self.llm.complete(request))
            .await
            .map_err(generate_err)?;

        let (body, image_prompt) = extract_image_directive(&response.content);
        if body.is_empty() {
            return Err(generate_err(ExternalError::invalid("llm", "empty output")));
        }

        let mut attachments = Vec::new();
        let mut image_skipped = None;
        if let Some(prompt) = image_prompt {
            if !limiter.try_acquire(now) {
                let reason = limiter.exhausted().to_string();
                info!(message_id = %message.id, "Image skipped: {reason}");
                image_skipped = Some(reason);
            } else {
                debug!(
                    message_id = %message.id,
                    remaining = limiter.remaining(now),
                    "Image quota token taken"
                );
                match with_timeout("image-generator", timeout, self.generator.generate_image(&prompt))
                    .await
                {
                    Ok(image) => attachments.push(image.into_attachment("reply-image")),
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "Image generation failed, sending text only");
                        image_skipped = Some(e.to_string());
                    }
                }
            }
        }

        Ok(ComposedReply {
            subject: reply_subject(&message.subject),
            body,
            attachments,
            image_skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::images::GeneratedImage;
    use crate::llm::{CompletionResponse, FinishReason};

    struct ScriptedLlm {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ExternalError> {
            let user = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().unwrap().push(user);
            Ok(CompletionResponse {
                content: self.reply.clone(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    struct StubImages {
        fail_caption: bool,
        fail_generate: bool,
        generated: Mutex<usize>,
    }

    impl StubImages {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_caption: false,
                fail_generate: false,
                generated: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageCaptioner for StubImages {
        async fn caption(&self, _image: &[u8]) -> Result<String, ExternalError> {
            if self.fail_caption {
                Err(ExternalError::request("captioner", "503"))
            } else {
                Ok("A red bicycle".to_string())
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for StubImages {
        async fn generate_image(&self, _prompt: &str) -> Result<GeneratedImage, ExternalError> {
            if self.fail_generate {
                return Err(ExternalError::request("image-generator", "quota"));
            }
            *self.generated.lock().unwrap() += 1;
            Ok(GeneratedImage {
                data: vec![1, 2, 3],
                content_type: "image/png".into(),
            })
        }
    }

    fn message(body: &str, with_image: bool) -> InboundEmail {
        let attachments = if with_image {
            vec![Attachment {
                filename: "bike.jpg".into(),
                content_type: "image/jpeg".into(),
                data: vec![0xff, 0xd8],
            }]
        } else {
            vec![]
        };
        InboundEmail {
            id: "m1".into(),
            uid: None,
            sender: "a@x.com".into(),
            subject: "Question".into(),
            body: body.into(),
            attachments,
            received_at: Utc::now(),
        }
    }

    fn composer(llm: Arc<ScriptedLlm>, images: Arc<StubImages>) -> ResponseComposer {
        ResponseComposer::new(llm, images.clone(), images, ComposerConfig::default())
    }

    fn limiter(quota: u32) -> RateLimiter {
        RateLimiter::new(quota, Duration::from_secs(3600))
    }

    #[test]
    fn directive_is_extracted_and_stripped() {
        let (text, prompt) =
            extract_image_directive("Here you go.\n[IMAGE: a sunset over hills]\nCheers");
        assert_eq!(text, "Here you go.\n\nCheers");
        assert_eq!(prompt.as_deref(), Some("a sunset over hills"));

        let (text, prompt) = extract_image_directive("No picture needed.");
        assert_eq!(text, "No picture needed.");
        assert!(prompt.is_none());
    }

    #[test]
    fn empty_directive_is_ignored() {
        let (text, prompt) = extract_image_directive("Hi [image: ] there");
        assert_eq!(text, "Hi  there");
        assert!(prompt.is_none());
    }

    #[tokio::test]
    async fn caption_is_folded_into_prompt() {
        let llm = ScriptedLlm::new("Nice bike!");
        let composer = composer(llm.clone(), StubImages::ok());
        let reply = composer
            .compose(&message("What is this?\n> old quote", true), &mut limiter(1), Utc::now())
            .await
            .unwrap();

        assert_eq!(reply.subject, "Re: Question");
        assert_eq!(reply.body, "Nice bike!");
        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("[Attached image: A red bicycle]"));
        assert!(!prompt.contains("old quote"));
    }

    #[tokio::test]
    async fn caption_failure_is_compose_error() {
        let images = Arc::new(StubImages {
            fail_caption: true,
            fail_generate: false,
            generated: Mutex::new(0),
        });
        let err = composer(ScriptedLlm::new("x"), images)
            .compose(&message("look", true), &mut limiter(1), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.stage, ComposeStage::Caption);
    }

    #[tokio::test]
    async fn empty_llm_output_is_compose_error() {
        let err = composer(ScriptedLlm::new("  [IMAGE: cat] "), StubImages::ok())
            .compose(&message("hi", false), &mut limiter(1), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.stage, ComposeStage::Generate);
        assert!(err.to_string().starts_with("generate: "));
    }

    #[tokio::test]
    async fn directive_attaches_generated_image() {
        let images = StubImages::ok();
        let reply = composer(ScriptedLlm::new("Sure!\n[IMAGE: a cat]"), images.clone())
            .compose(&message("draw a cat", false), &mut limiter(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(reply.body, "Sure!");
        assert_eq!(reply.attachments.len(), 1);
        assert_eq!(reply.attachments[0].filename, "reply-image.png");
        assert!(reply.image_skipped.is_none());
        assert_eq!(*images.generated.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_quota_degrades_to_text() {
        let images = StubImages::ok();
        let reply = composer(ScriptedLlm::new("Sure!\n[IMAGE: a cat]"), images.clone())
            .compose(&message("draw a cat", false), &mut limiter(0), Utc::now())
            .await
            .unwrap();
        assert_eq!(reply.body, "Sure!");
        assert!(reply.attachments.is_empty());
        assert!(reply.image_skipped.unwrap().contains("Rate limit exhausted"));
        assert_eq!(*images.generated.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_text() {
        let images = Arc::new(StubImages {
            fail_caption: false,
            fail_generate: true,
            generated: Mutex::new(0),
        });
        let reply = composer(ScriptedLlm::new("Sure!\n[IMAGE: a cat]"), images)
            .compose(&message("draw a cat", false), &mut limiter(3), Utc::now())
            .await
            .unwrap();
        assert!(reply.attachments.is_empty());
        assert!(reply.image_skipped.unwrap().contains("image-generator"));
    }

    #[tokio::test]
    async fn body_is_truncated_to_prompt_budget() {
        let llm = ScriptedLlm::new("ok");
        let composer = ResponseComposer::new(
            llm.clone(),
            StubImages::ok(),
            StubImages::ok(),
            ComposerConfig {
                max_prompt_chars: 10,
                ..Default::default()
            },
        );
        composer
            .compose(&message(&"y".repeat(500), false), &mut limiter(0), Utc::now())
            .await
            .unwrap();
        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert_eq!(prompt, format!("Subject: Question\n\n{}", "y".repeat(10)));
    }
}
