//! Social cycle — one randomized action on the community platform per run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::error::{Error, ExternalError, with_timeout};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::social::{Post, SocialPlatform};
use crate::store::{ActionKind, ActionOutcome, Database};

const POST_PROMPT: &str = "You are an AI agent taking part in Moltbook, a forum where AI agents \
share ideas. Write one short, original post (under 120 words) about something you find \
genuinely interesting. Put a short title on the first line, then the post. No hashtags.";

const COMMENT_PROMPT: &str = "You are an AI agent taking part in Moltbook, a forum where AI \
agents share ideas. Write an interesting and relevant comment (under 80 words) on the post \
below. Be specific and friendly. Reply with the comment text only.";

/// Longest post body quoted into the comment prompt.
const MAX_QUOTED_CHARS: usize = 2000;

/// Longest generated text kept in the action log.
const MAX_DETAIL_CHARS: usize = 200;

/// Social cycle configuration.
#[derive(Debug, Clone)]
pub struct SocialConfig {
    /// Window in which the same (kind, target) pair is not repeated.
    pub cooldown: Duration,
    /// Upper bound on `done` actions in any trailing 24 hours.
    pub max_actions_per_day: u32,
    /// Bound on each platform or LLM call.
    pub call_timeout: Duration,
    pub max_tokens: u32,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(86_400),
            max_actions_per_day: 12,
            call_timeout: Duration::from_secs(120),
            max_tokens: 256,
        }
    }
}

/// Performs and records social actions.
pub struct SocialCycle {
    db: Arc<dyn Database>,
    platform: Arc<dyn SocialPlatform>,
    llm: Arc<dyn LlmProvider>,
    config: SocialConfig,
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl SocialCycle {
    pub fn new(
        db: Arc<dyn Database>,
        platform: Arc<dyn SocialPlatform>,
        llm: Arc<dyn LlmProvider>,
        config: SocialConfig,
    ) -> Self {
        Self {
            db,
            platform,
            llm,
            config,
        }
    }

    /// Run one action and record it.
    ///
    /// Platform and LLM failures are recorded as `failed` and returned as
    /// `Ok(ActionOutcome::Failed)`. Only store failures return `Err`.
    pub async fn run_once(&self, rng: &mut (dyn RngCore + Send)) -> Result<ActionOutcome, Error> {
        let kind = *ActionKind::ALL.choose(rng).unwrap_or(&ActionKind::Upvote);

        let since = Utc::now() - chrono::Duration::hours(24);
        let done_today = self.db.count_actions_since(ActionOutcome::Done, since).await?;
        if done_today >= self.config.max_actions_per_day as usize {
            info!(
                done_today,
                max = self.config.max_actions_per_day,
                "Social frequency bound reached"
            );
            let detail = format!("{done_today} actions in last 24h");
            return self
                .finish(kind, None, ActionOutcome::SkippedQuota, Some(&detail))
                .await;
        }

        let target = if kind.needs_target() {
            match self.pick_target(kind, rng).await? {
                Ok(Some(post)) => Some(post),
                Ok(None) => {
                    return self
                        .finish(kind, None, ActionOutcome::SkippedNoTarget, None)
                        .await;
                }
                Err(e) => {
                    let detail = format!("list: {e}");
                    return self
                        .finish(kind, None, ActionOutcome::Failed, Some(&detail))
                        .await;
                }
            }
        } else {
            None
        };
        let target_id = target.as_ref().map(|p| p.id.as_str());

        let result = match kind {
            ActionKind::Post => self.post().await,
            ActionKind::Comment => match &target {
                Some(post) => self.comment(post).await,
                None => Err(ExternalError::request("social", "comment without target")),
            },
            ActionKind::Upvote => match target_id {
                Some(id) => with_timeout("social", self.config.call_timeout, self.platform.upvote(id))
                    .await
                    .map(|_| None),
                None => Err(ExternalError::request("social", "upvote without target")),
            },
        };

        match result {
            Ok(detail) => {
                self.finish(kind, target_id, ActionOutcome::Done, detail.as_deref())
                    .await
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Social action failed");
                let detail = e.to_string();
                self.finish(kind, target_id, ActionOutcome::Failed, Some(&detail))
                    .await
            }
        }
    }

    async fn finish(
        &self,
        kind: ActionKind,
        target_id: Option<&str>,
        outcome: ActionOutcome,
        detail: Option<&str>,
    ) -> Result<ActionOutcome, Error> {
        self.db
            .record_action(kind, target_id, outcome, detail)
            .await?;
        info!(kind = %kind, post_id = ?target_id, outcome = %outcome, "Social cycle complete");
        Ok(outcome)
    }

    /// Choose a post not acted on with `kind` inside the cooldown window.
    ///
    /// The outer `Result` carries store failures; the inner one platform failures.
    async fn pick_target(
        &self,
        kind: ActionKind,
        rng: &mut (dyn RngCore + Send),
    ) -> Result<Result<Option<Post>, ExternalError>, Error> {
        let posts = match with_timeout(
            "social",
            self.config.call_timeout,
            self.platform.list_recent_posts(),
        )
        .await
        {
            Ok(posts) => posts,
            Err(e) => return Ok(Err(e)),
        };

        let window = chrono::Duration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let recent: HashSet<String> = self
            .db
            .recent_actions(kind, window)
            .await?
            .into_iter()
            .filter_map(|a| a.target_id)
            .collect();

        let candidates: Vec<Post> = posts
            .into_iter()
            .filter(|p| !p.id.is_empty() && !recent.contains(&p.id))
            .collect();
        debug!(kind = %kind, candidates = candidates.len(), cooling = recent.len(), "Targets filtered");

        Ok(Ok(candidates.choose(rng).cloned()))
    }

    async fn generate(&self, system: &str, user: String) -> Result<String, ExternalError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_max_tokens(self.config.max_tokens)
        .with_temperature(0.7);

        let response = with_timeout("llm", self.config.call_timeout, self.llm.complete(request)).await?;
        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(ExternalError::invalid("llm", "empty output"));
        }
        Ok(text)
    }

    async fn post(&self) -> Result<Option<String>, ExternalError> {
        let text = self
            .generate(POST_PROMPT, "Write today's post.".to_string())
            .await?;
        with_timeout("social", self.config.call_timeout, self.platform.create_post(&text)).await?;
        Ok(Some(truncate(&text, MAX_DETAIL_CHARS)))
    }

    async fn comment(&self, post: &Post) -> Result<Option<String>, ExternalError> {
        let content = post.content.as_deref().unwrap_or("");
        let user = format!(
            "Title: {}\n\n```{}```",
            post.title,
            truncate(content, MAX_QUOTED_CHARS)
        );
        let text = self.generate(COMMENT_PROMPT, user).await?;
        with_timeout(
            "social",
            self.config.call_timeout,
            self.platform.create_comment(&post.id, &text),
        )
        .await?;
        Ok(Some(truncate(&text, MAX_DETAIL_CHARS)))
    }
}
