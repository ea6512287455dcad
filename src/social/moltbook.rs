//! Moltbook REST client.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ExternalError;
use crate::social::{Post, SocialPlatform};

const SERVICE: &str = "social";

/// Longest title the agent will send.
const MAX_TITLE_CHARS: usize = 120;

/// Moltbook API configuration.
#[derive(Debug, Clone)]
pub struct MoltbookConfig {
    pub api_key: SecretString,
    pub base_url: String,
    /// Community new posts are published to.
    pub submolt: String,
}

impl MoltbookConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MOLTBOOK_API_KEY` is not set (social task disabled).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("MOLTBOOK_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;

        let base_url = std::env::var("MOLTBOOK_BASE_URL")
            .unwrap_or_else(|_| "https://www.moltbook.com/api/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let submolt = std::env::var("MOLTBOOK_SUBMOLT").unwrap_or_else(|_| "general".to_string());

        Some(Self {
            api_key: SecretString::from(api_key),
            base_url,
            submolt,
        })
    }
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(default)]
    posts: Vec<Post>,
}

/// Split generated text into a post title and body.
///
/// The first non-empty line (markdown heading markers removed) is the title;
/// the rest is the body. Single-line text is used for both.
pub fn split_title(text: &str) -> (String, String) {
    let text = text.trim();
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, rest.trim()),
        None => (text, ""),
    };
    let title: String = first
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches('"')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let body = if rest.is_empty() { text } else { rest };
    (title, body.to_string())
}

/// HTTP client for the Moltbook API.
pub struct MoltbookClient {
    client: reqwest::Client,
    config: MoltbookConfig,
}

impl MoltbookClient {
    pub fn new(config: MoltbookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<(), ExternalError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ExternalError::request(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalError::request(
                SERVICE,
                format!("POST {path}: HTTP {status}: {text}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SocialPlatform for MoltbookClient {
    async fn list_recent_posts(&self) -> Result<Vec<Post>, ExternalError> {
        let response = self
            .client
            .get(self.url("/feed"))
            .query(&[("sort", "hot"), ("limit", "25")])
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| ExternalError::request(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalError::request(
                SERVICE,
                format!("GET /feed: HTTP {status}: {text}"),
            ));
        }

        let feed: FeedResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::invalid(SERVICE, e.to_string()))?;
        Ok(feed.posts)
    }

    async fn create_post(&self, text: &str) -> Result<(), ExternalError> {
        let (title, content) = split_title(text);
        if title.is_empty() {
            return Err(ExternalError::request(SERVICE, "empty post"));
        }
        self.post_json(
            "/posts",
            serde_json::json!({
                "submolt": self.config.submolt,
                "title": title,
                "content": content,
            }),
        )
        .await?;
        tracing::info!(submolt = %self.config.submolt, title = %title, "Moltbook post created");
        Ok(())
    }

    async fn create_comment(&self, post_id: &str, text: &str) -> Result<(), ExternalError> {
        self.post_json(
            &format!("/posts/{post_id}/comments"),
            serde_json::json!({ "content": text }),
        )
        .await
    }

    async fn upvote(&self, post_id: &str) -> Result<(), ExternalError> {
        self.post_json(&format!("/posts/{post_id}/upvote"), serde_json::json!({}))
            .await
    }
}
