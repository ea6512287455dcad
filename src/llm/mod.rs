//! LLM integration for the inbox agent.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//! - **Local**: a llama.cpp server speaking the OpenAI completions protocol
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait.

pub mod local;
pub mod provider;
mod rig_adapter;

pub use local::LocalLlm;
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
    Local,
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::InvalidValue {
                key: "LLM_BACKEND".to_string(),
                message: format!("unknown backend '{other}' (expected anthropic, openai or local)"),
            }),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    /// Server root for the local backend.
    pub base_url: String,
    /// Token cap for each completion.
    pub max_tokens: u32,
}

impl LlmConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = std::env::var("LLM_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()?;

        let api_key = std::env::var("LLM_API_KEY").unwrap_or_default();
        if backend != LlmBackend::Local && api_key.is_empty() {
            return Err(ConfigError::MissingEnvVar("LLM_API_KEY".to_string()));
        }

        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| {
            match backend {
                LlmBackend::Anthropic => "claude-sonnet-4-20250514",
                LlmBackend::OpenAi => "gpt-4o",
                LlmBackend::Local => "phi-3-mini-4k-instruct",
            }
            .to_string()
        });

        let base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let max_tokens = match std::env::var("LLM_MAX_TOKENS") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LLM_MAX_TOKENS".to_string(),
                message: format!("'{v}' is not a positive integer"),
            })?,
            Err(_) => 512,
        };

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
            base_url,
            max_tokens,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
        LlmBackend::Local => {
            tracing::info!("Using local LLM at {} (model: {})", config.base_url, config.model);
            Ok(Arc::new(LocalLlm::new(&config.base_url, &config.model)))
        }
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "LLM_API_KEY".to_string(),
                message: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "LLM_API_KEY".to_string(),
                message: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: SecretString::from("test-key"),
            model: model.to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            max_tokens: 512,
        }
    }

    #[test]
    fn test_create_provider_missing_key_still_constructs() {
        // rig-core clients accept any string as API key at construction time.
        let provider = create_provider(&config(LlmBackend::Anthropic, "claude-3-5-sonnet-latest"));
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "claude-3-5-sonnet-latest");
    }

    #[test]
    fn test_create_openai_provider() {
        let provider = create_provider(&config(LlmBackend::OpenAi, "gpt-4o"));
        assert_eq!(provider.unwrap().model_name(), "gpt-4o");
    }

    #[test]
    fn test_create_local_provider() {
        let provider = create_provider(&config(LlmBackend::Local, "phi-3-mini"));
        assert_eq!(provider.unwrap().model_name(), "phi-3-mini");
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("Anthropic".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert_eq!(" local ".parse::<LlmBackend>().unwrap(), LlmBackend::Local);
        assert!("gemini".parse::<LlmBackend>().is_err());
    }
}
