//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so lexical order equals time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ActionKind, ActionOutcome, ActionRecord, ApprovalSource, ApprovedSender, Database, Heartbeat,
    MessageOutcome, ProcessedMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every column we write.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Normalise a sender identifier for storage and lookup.
fn normalize_sender(sender: &str) -> String {
    sender.trim().to_lowercase()
}

/// Approved-sender keys that would admit `sender`: the address itself,
/// `@domain`, bare `domain`, and the `*` wildcard.
fn approval_keys(sender: &str) -> [String; 4] {
    let sender = normalize_sender(sender);
    let domain = sender
        .rsplit_once('@')
        .map(|(_, d)| d.to_string())
        .unwrap_or_default();
    let at_domain = if domain.is_empty() {
        String::new()
    } else {
        format!("@{domain}")
    };
    [sender, at_domain, domain, "*".to_string()]
}

/// Drain `rows`, skipping rows that fail to decode. A failed read is an error.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &str,
    decode: impl Fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Result<Vec<T>, DatabaseError> {
    let mut items = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match decode(&row) {
                Ok(item) => items.push(item),
                Err(e) => warn!(op, "Skipping undecodable row: {e}"),
            },
            Ok(None) => return Ok(items),
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

fn row_to_processed(row: &libsql::Row) -> Result<ProcessedMessage, libsql::Error> {
    let outcome_str: String = row.get(2)?;
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(ProcessedMessage {
        message_id: row.get(0)?,
        sender: row.get(1)?,
        outcome: outcome_str.parse().unwrap_or(MessageOutcome::Failed),
        detail: row.get(3).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_action(row: &libsql::Row) -> Result<ActionRecord, libsql::Error> {
    let kind_str: String = row.get(1)?;
    let outcome_str: String = row.get(3)?;
    let created_str: String = row.get(5)?;

    Ok(ActionRecord {
        id: row.get(0)?,
        kind: kind_str.parse().unwrap_or(ActionKind::Post),
        target_id: row.get(2).ok(),
        outcome: outcome_str.parse().unwrap_or(ActionOutcome::Failed),
        detail: row.get(4).ok(),
        created_at: parse_datetime(&created_str),
    })
}

const PROCESSED_COLUMNS: &str = "message_id, sender, outcome, detail, created_at, updated_at";

const ACTION_COLUMNS: &str = "id, kind, target_id, outcome, detail, created_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Approved senders ────────────────────────────────────────────

    async fn is_approved(&self, sender: &str) -> Result<bool, DatabaseError> {
        let [exact, at_domain, domain, wildcard] = approval_keys(sender);
        let count = self
            .count(
                "SELECT COUNT(*) FROM approved_senders
                 WHERE sender IN (?1, ?2, ?3, ?4) AND sender != ''",
                params![exact, at_domain, domain, wildcard],
            )
            .await?;
        Ok(count > 0)
    }

    async fn record_approval(
        &self,
        sender: &str,
        source: ApprovalSource,
    ) -> Result<(), DatabaseError> {
        let sender = normalize_sender(sender);
        if sender.is_empty() {
            return Err(DatabaseError::Query(
                "record_approval: empty sender".to_string(),
            ));
        }
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO approved_senders (sender, source, added_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(sender) DO NOTHING",
                params![sender.clone(), source.as_str(), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_approval: {e}")))?;

        if inserted > 0 {
            info!(sender = %sender, source = source.as_str(), "Sender approved");
        }
        Ok(())
    }

    async fn list_approved(&self) -> Result<Vec<ApprovedSender>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT sender, source, added_at FROM approved_senders ORDER BY added_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_approved: {e}")))?;

        collect_rows(rows, "list_approved", |row| {
            let source: String = row.get(1)?;
            let added: String = row.get(2)?;
            Ok(ApprovedSender {
                sender: row.get(0)?,
                source: source.parse().unwrap_or(ApprovalSource::Admin),
                added_at: parse_datetime(&added),
            })
        })
        .await
    }

    // ── Processed messages ──────────────────────────────────────────

    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .count(
                "SELECT COUNT(*) FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await?;
        Ok(count > 0)
    }

    async fn mark_in_flight(&self, message_id: &str, sender: &str) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO processed_messages (message_id, sender, outcome, detail, created_at, updated_at)
                 VALUES (?1, ?2, 'in_flight', NULL, ?3, ?3)
                 ON CONFLICT(message_id) DO NOTHING",
                params![message_id, normalize_sender(sender), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_in_flight: {e}")))?;
        debug!(message_id, "Message marked in flight");
        Ok(())
    }

    async fn record_processed(
        &self,
        message_id: &str,
        sender: &str,
        outcome: MessageOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO processed_messages (message_id, sender, outcome, detail, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(message_id) DO UPDATE SET
                    outcome = excluded.outcome,
                    detail = excluded.detail,
                    updated_at = excluded.updated_at",
                params![
                    message_id,
                    normalize_sender(sender),
                    outcome.as_str(),
                    opt_text(detail),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_processed: {e}")))?;

        debug!(message_id, outcome = %outcome, "Message outcome recorded");
        Ok(())
    }

    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROCESSED_COLUMNS} FROM processed_messages WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_processed(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn recover_in_flight(&self) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE processed_messages SET outcome = 'failed', detail = 'interrupted', updated_at = ?1
                 WHERE outcome = 'in_flight'",
                params![ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_in_flight: {e}")))?;

        if count > 0 {
            warn!(count, "Recovered interrupted messages as failed");
        }
        Ok(count as usize)
    }

    // ── Social actions ──────────────────────────────────────────────

    async fn record_action(
        &self,
        kind: ActionKind,
        target_id: Option<&str>,
        outcome: ActionOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO social_actions (id, kind, target_id, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.clone(),
                    kind.as_str(),
                    opt_text(target_id),
                    outcome.as_str(),
                    opt_text(detail),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_action: {e}")))?;

        debug!(id = %id, kind = %kind, outcome = %outcome, "Social action recorded");
        Ok(())
    }

    async fn recent_actions(
        &self,
        kind: ActionKind,
        window: Duration,
    ) -> Result<Vec<ActionRecord>, DatabaseError> {
        let cutoff = ts(Utc::now() - window);
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM social_actions
                     WHERE kind = ?1 AND created_at >= ?2 ORDER BY created_at DESC"
                ),
                params![kind.as_str(), cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_actions: {e}")))?;

        collect_rows(rows, "recent_actions", row_to_action).await
    }

    async fn count_actions_since(
        &self,
        outcome: ActionOutcome,
        since: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .count(
                "SELECT COUNT(*) FROM social_actions WHERE outcome = ?1 AND created_at >= ?2",
                params![outcome.as_str(), ts(since)],
            )
            .await?;
        Ok(count as usize)
    }

    // ── Heartbeats ──────────────────────────────────────────────────

    async fn record_heartbeat(
        &self,
        task: &str,
        outcome: &str,
        consecutive_failures: u32,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO heartbeats (task, last_run_at, last_outcome, consecutive_failures)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task) DO UPDATE SET
                    last_run_at = excluded.last_run_at,
                    last_outcome = excluded.last_outcome,
                    consecutive_failures = excluded.consecutive_failures",
                params![task, ts(Utc::now()), outcome, i64::from(consecutive_failures)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_heartbeat: {e}")))?;
        Ok(())
    }

    async fn get_heartbeat(&self, task: &str) -> Result<Option<Heartbeat>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT task, last_run_at, last_outcome, consecutive_failures
                 FROM heartbeats WHERE task = ?1",
                params![task],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_heartbeat: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parsed = (|| -> Result<Heartbeat, libsql::Error> {
                    let last_run: String = row.get(1)?;
                    let failures: i64 = row.get(3)?;
                    Ok(Heartbeat {
                        task: row.get(0)?,
                        last_run_at: parse_datetime(&last_run),
                        last_outcome: row.get(2)?,
                        consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
                    })
                })();
                parsed
                    .map(Some)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_heartbeat: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Approved sender tests ───────────────────────────────────────

    #[tokio::test]
    async fn approval_is_case_insensitive() {
        let db = test_db().await;
        assert!(!db.is_approved("alice@example.com").await.unwrap());

        db.record_approval("Alice@Example.com", ApprovalSource::Phrase)
            .await
            .unwrap();

        assert!(db.is_approved("alice@example.com").await.unwrap());
        assert!(db.is_approved("ALICE@EXAMPLE.COM").await.unwrap());
        assert!(!db.is_approved("bob@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn domain_patterns_match_whole_domain() {
        let db = test_db().await;
        db.record_approval("@trusted.org", ApprovalSource::Admin)
            .await
            .unwrap();
        db.record_approval("partner.io", ApprovalSource::Admin)
            .await
            .unwrap();

        assert!(db.is_approved("anyone@trusted.org").await.unwrap());
        assert!(db.is_approved("ceo@partner.io").await.unwrap());
        assert!(!db.is_approved("random@evil.com").await.unwrap());
        assert!(!db.is_approved("trusted.org").await.unwrap());
    }

    #[tokio::test]
    async fn re_approval_keeps_original_row() {
        let db = test_db().await;
        db.record_approval("admin@example.com", ApprovalSource::Admin)
            .await
            .unwrap();
        db.record_approval("admin@example.com", ApprovalSource::Phrase)
            .await
            .unwrap();

        let all = db.list_approved().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source, ApprovalSource::Admin);
    }

    #[tokio::test]
    async fn empty_sender_is_rejected() {
        let db = test_db().await;
        assert!(db.record_approval("  ", ApprovalSource::Admin).await.is_err());
    }

    // ── Processed message tests ─────────────────────────────────────

    #[tokio::test]
    async fn record_processed_is_idempotent() {
        let db = test_db().await;
        assert!(!db.is_processed("m1").await.unwrap());

        db.record_processed("m1", "a@x.com", MessageOutcome::Skipped, Some("sender-not-approved"))
            .await
            .unwrap();
        db.record_processed("m1", "a@x.com", MessageOutcome::Skipped, Some("sender-not-approved"))
            .await
            .unwrap();

        assert!(db.is_processed("m1").await.unwrap());
        let n = db
            .count("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn terminal_outcome_replaces_in_flight() {
        let db = test_db().await;
        db.mark_in_flight("m2", "a@x.com").await.unwrap();
        assert!(db.is_processed("m2").await.unwrap());
        assert_eq!(
            db.get_processed("m2").await.unwrap().unwrap().outcome,
            MessageOutcome::InFlight
        );

        db.record_processed("m2", "a@x.com", MessageOutcome::Replied, None)
            .await
            .unwrap();
        let record = db.get_processed("m2").await.unwrap().unwrap();
        assert_eq!(record.outcome, MessageOutcome::Replied);
        assert!(record.detail.is_none());
    }

    #[tokio::test]
    async fn mark_in_flight_never_downgrades_terminal() {
        let db = test_db().await;
        db.record_processed("m3", "a@x.com", MessageOutcome::Replied, None)
            .await
            .unwrap();
        db.mark_in_flight("m3", "a@x.com").await.unwrap();
        assert_eq!(
            db.get_processed("m3").await.unwrap().unwrap().outcome,
            MessageOutcome::Replied
        );
    }

    #[tokio::test]
    async fn recover_in_flight_marks_interrupted() {
        let db = test_db().await;
        db.mark_in_flight("m4", "a@x.com").await.unwrap();
        db.record_processed("m5", "b@x.com", MessageOutcome::Replied, None)
            .await
            .unwrap();

        assert_eq!(db.recover_in_flight().await.unwrap(), 1);

        let record = db.get_processed("m4").await.unwrap().unwrap();
        assert_eq!(record.outcome, MessageOutcome::Failed);
        assert_eq!(record.detail.as_deref(), Some("interrupted"));
        assert_eq!(db.recover_in_flight().await.unwrap(), 0);
    }

    // ── Social action tests ─────────────────────────────────────────

    #[tokio::test]
    async fn recent_actions_filters_by_kind() {
        let db = test_db().await;
        db.record_action(ActionKind::Upvote, Some("p1"), ActionOutcome::Done, None)
            .await
            .unwrap();
        db.record_action(ActionKind::Comment, Some("p1"), ActionOutcome::Done, Some("nice"))
            .await
            .unwrap();
        db.record_action(ActionKind::Post, None, ActionOutcome::Failed, Some("500"))
            .await
            .unwrap();

        let upvotes = db
            .recent_actions(ActionKind::Upvote, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(upvotes.len(), 1);
        assert_eq!(upvotes[0].target_id.as_deref(), Some("p1"));

        let posts = db
            .recent_actions(ActionKind::Post, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].target_id.is_none());
        assert_eq!(posts[0].outcome, ActionOutcome::Failed);
    }

    #[tokio::test]
    async fn recent_actions_respects_window() {
        let db = test_db().await;
        db.conn()
            .execute(
                "INSERT INTO social_actions (id, kind, target_id, outcome, detail, created_at)
                 VALUES ('old', 'upvote', 'p9', 'done', NULL, ?1)",
                params![ts(Utc::now() - Duration::days(3))],
            )
            .await
            .unwrap();

        let recent = db
            .recent_actions(ActionKind::Upvote, Duration::days(1))
            .await
            .unwrap();
        assert!(recent.is_empty());

        let wider = db
            .recent_actions(ActionKind::Upvote, Duration::days(7))
            .await
            .unwrap();
        assert_eq!(wider.len(), 1);
    }

    #[tokio::test]
    async fn count_actions_since_counts_outcome_only() {
        let db = test_db().await;
        db.record_action(ActionKind::Upvote, Some("p1"), ActionOutcome::Done, None)
            .await
            .unwrap();
        db.record_action(ActionKind::Post, None, ActionOutcome::Done, None)
            .await
            .unwrap();
        db.record_action(ActionKind::Comment, None, ActionOutcome::SkippedNoTarget, None)
            .await
            .unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert_eq!(db.count_actions_since(ActionOutcome::Done, since).await.unwrap(), 2);
        assert_eq!(
            db.count_actions_since(ActionOutcome::SkippedNoTarget, since)
                .await
                .unwrap(),
            1
        );
    }

    // ── Heartbeat tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn failed_row_read_is_an_error() {
        let db = test_db().await;
        let rows = db
            .conn()
            .query(
                "SELECT abs(x) FROM (SELECT 1 AS x UNION ALL SELECT -9223372036854775807 - 1)",
                (),
            )
            .await;
        // The overflow surfaces on the second row, after one good read.
        let result = match rows {
            Ok(rows) => collect_rows(rows, "overflow", |row| row.get::<i64>(0)).await,
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        };
        assert!(matches!(result, Err(DatabaseError::Query(_))));
    }

    #[tokio::test]
    async fn heartbeat_upserts() {
        let db = test_db().await;
        assert!(db.get_heartbeat("mail").await.unwrap().is_none());

        db.record_heartbeat("mail", "error", 2).await.unwrap();
        db.record_heartbeat("mail", "ok", 0).await.unwrap();

        let hb = db.get_heartbeat("mail").await.unwrap().unwrap();
        assert_eq!(hb.last_outcome, "ok");
        assert_eq!(hb.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("agent.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.record_approval("a@x.com", ApprovalSource::Admin)
                .await
                .unwrap();
            db.record_processed("m1", "a@x.com", MessageOutcome::Replied, None)
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.is_approved("a@x.com").await.unwrap());
        assert!(db.is_processed("m1").await.unwrap());
    }
}
