//! Local model served by llama.cpp's OpenAI-compatible `/v1/completions` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const SERVICE: &str = "llm";

/// Stop sequence that ends the assistant turn.
const TURN_STOP: &str = "User:";

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    stop: Vec<&'a str>,
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Render a chat request as a plain `User:`/`Assistant:` transcript.
pub fn render_transcript(request: &CompletionRequest) -> String {
    let mut out = String::new();
    if let Some(system) = request.system_prompt() {
        out.push_str(&system);
        out.push_str("\n\n");
    }
    for message in &request.messages {
        match message.role {
            Role::System => {}
            Role::User => {
                out.push_str("User: ");
                out.push_str(&message.content);
                out.push('\n');
            }
            Role::Assistant => {
                out.push_str("Assistant: ");
                out.push_str(&message.content);
                out.push('\n');
            }
        }
    }
    out.push_str("Assistant: ");
    out
}

/// Client for a llama.cpp (or compatible) completion server.
pub struct LocalLlm {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl LocalLlm {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for LocalLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ExternalError> {
        let body = CompletionBody {
            model: &self.model,
            prompt: render_transcript(&request),
            max_tokens: request.max_tokens.unwrap_or(256),
            temperature: request.temperature.unwrap_or(0.7),
            stop: vec![TURN_STOP],
        };

        let response = self
            .client
            .post(format!("{}/v1/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ExternalError::request(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalError::request(
                SERVICE,
                format!("HTTP {status}: {text}"),
            ));
        }

        let reply: CompletionReply = response
            .json()
            .await
            .map_err(|e| ExternalError::invalid(SERVICE, e.to_string()))?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ExternalError::invalid(SERVICE, "no choices in response"))?;

        let (input_tokens, output_tokens) = reply
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        tracing::debug!(model = %self.model, output_tokens, "Local completion");

        Ok(CompletionResponse {
            content: choice.text.trim().to_string(),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref()),
        })
    }
}
