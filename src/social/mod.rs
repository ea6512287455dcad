//! Community platform integration — the `SocialPlatform` trait, Moltbook client, and the social cycle.

pub mod cycle;
pub mod moltbook;

pub use cycle::{SocialConfig, SocialCycle};
pub use moltbook::{MoltbookClient, MoltbookConfig};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ExternalError;

/// A post on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// The community platform. Implementations report failures under the `social` service name.
#[async_trait]
pub trait SocialPlatform: Send + Sync {
    /// Current feed, most relevant first.
    async fn list_recent_posts(&self) -> Result<Vec<Post>, ExternalError>;

    /// Publish a new post. The first line of `text` becomes the title.
    async fn create_post(&self, text: &str) -> Result<(), ExternalError>;

    async fn create_comment(&self, post_id: &str, text: &str) -> Result<(), ExternalError>;

    async fn upvote(&self, post_id: &str) -> Result<(), ExternalError>;
}
