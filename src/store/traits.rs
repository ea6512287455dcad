//! `Database` trait — single async interface for all agent persistence.
//!
//! Three logical tables survive restarts: approved senders, processed
//! messages, and social actions. Heartbeats record scheduler liveness.
//! Every write is a single-row upsert keyed by a unique identifier.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::DatabaseError;

/// How a sender came to be approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    /// Explicit admin action (CLI or startup seed).
    Admin,
    /// The approval phrase appeared in one of the sender's messages.
    Phrase,
}

impl ApprovalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Phrase => "phrase",
        }
    }
}

impl FromStr for ApprovalSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "phrase" => Ok(Self::Phrase),
            other => Err(format!("unknown approval source '{other}'")),
        }
    }
}

/// A sender (address or domain pattern) permitted to receive automatic replies.
#[derive(Debug, Clone)]
pub struct ApprovedSender {
    pub sender: String,
    pub source: ApprovalSource,
    pub added_at: DateTime<Utc>,
}

/// Terminal (or provisional) outcome of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOutcome {
    /// Provisional: written before Compose, replaced by a terminal outcome.
    InFlight,
    Replied,
    Skipped,
    Failed,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Replied => "replied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(Self::InFlight),
            "replied" => Ok(Self::Replied),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message outcome '{other}'")),
        }
    }
}

/// A persisted processed-message record.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub sender: String,
    pub outcome: MessageOutcome,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of social-platform action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Post,
    Comment,
    Upvote,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [Self::Post, Self::Comment, Self::Upvote];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Upvote => "upvote",
        }
    }

    /// Comment and upvote act on an existing post.
    pub fn needs_target(&self) -> bool {
        !matches!(self, Self::Post)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            "upvote" => Ok(Self::Upvote),
            other => Err(format!("unknown action kind '{other}'")),
        }
    }
}

/// Outcome of one social cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionOutcome {
    Done,
    SkippedNoTarget,
    SkippedQuota,
    Failed,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::SkippedNoTarget => "skipped_no_target",
            Self::SkippedQuota => "skipped_quota",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(Self::Done),
            "skipped_no_target" => Ok(Self::SkippedNoTarget),
            "skipped_quota" => Ok(Self::SkippedQuota),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown action outcome '{other}'")),
        }
    }
}

/// A logged social-platform action.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub id: String,
    pub kind: ActionKind,
    pub target_id: Option<String>,
    pub outcome: ActionOutcome,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Last known liveness of a scheduled task.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub task: String,
    pub last_run_at: DateTime<Utc>,
    pub last_outcome: String,
    pub consecutive_failures: u32,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Approved senders ────────────────────────────────────────────

    /// Whether `sender` matches any approved address or domain pattern.
    async fn is_approved(&self, sender: &str) -> Result<bool, DatabaseError>;

    /// Record `sender` as approved. Keeps the existing row if already present.
    async fn record_approval(
        &self,
        sender: &str,
        source: ApprovalSource,
    ) -> Result<(), DatabaseError>;

    /// All approved senders, oldest first.
    async fn list_approved(&self) -> Result<Vec<ApprovedSender>, DatabaseError>;

    // ── Processed messages ──────────────────────────────────────────

    /// Whether any record (provisional or terminal) exists for `message_id`.
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Write the provisional `in_flight` record before composing a reply.
    async fn mark_in_flight(&self, message_id: &str, sender: &str) -> Result<(), DatabaseError>;

    /// Upsert the terminal record for `message_id`.
    async fn record_processed(
        &self,
        message_id: &str,
        sender: &str,
        outcome: MessageOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Look up the record for `message_id`.
    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError>;

    /// Turn `in_flight` rows left by a crash into `failed`. Returns rows changed.
    async fn recover_in_flight(&self) -> Result<usize, DatabaseError>;

    // ── Social actions ──────────────────────────────────────────────

    /// Log a social action.
    async fn record_action(
        &self,
        kind: ActionKind,
        target_id: Option<&str>,
        outcome: ActionOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Actions of `kind` newer than `window`, newest first.
    async fn recent_actions(
        &self,
        kind: ActionKind,
        window: Duration,
    ) -> Result<Vec<ActionRecord>, DatabaseError>;

    /// Count actions of any kind with `outcome` since `since`.
    async fn count_actions_since(
        &self,
        outcome: ActionOutcome,
        since: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Heartbeats ──────────────────────────────────────────────────

    /// Upsert the liveness row for `task`.
    async fn record_heartbeat(
        &self,
        task: &str,
        outcome: &str,
        consecutive_failures: u32,
    ) -> Result<(), DatabaseError>;

    /// Read the liveness row for `task`.
    async fn get_heartbeat(&self, task: &str) -> Result<Option<Heartbeat>, DatabaseError>;
}
