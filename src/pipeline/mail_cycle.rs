//! Mail cycle — poll, dedup, gate, compose, send, record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channels::email_types::same_mailbox;
use crate::channels::{InboundEmail, MailTransport, OutboundEmail};
use crate::error::{Error, with_timeout};
use crate::images::RateLimiter;
use crate::pipeline::composer::ResponseComposer;
use crate::pipeline::gate::{AdmissionGate, GateDecision};
use crate::store::{Database, MessageOutcome};
use crate::worker::clock::Clock;
use crate::worker::shutdown::Shutdown;

/// Per-run counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailCycleReport {
    pub fetched: usize,
    /// Already recorded, or repeated within the batch.
    pub duplicates: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Left unrecorded because shutdown was requested.
    pub interrupted: usize,
}

/// Handles one inbox poll per run.
pub struct MailCycle {
    db: Arc<dyn Database>,
    transport: Arc<dyn MailTransport>,
    gate: AdmissionGate,
    composer: ResponseComposer,
    clock: Arc<dyn Clock>,
    /// The agent's own address.
    own_address: String,
    call_timeout: Duration,
}

impl MailCycle {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn MailTransport>,
        gate: AdmissionGate,
        composer: ResponseComposer,
        clock: Arc<dyn Clock>,
        own_address: &str,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            gate,
            composer,
            clock,
            own_address: own_address.to_string(),
            call_timeout,
        }
    }

    /// Poll once and handle every new message in arrival order.
    ///
    /// Per-message failures are recorded and the batch continues. A poll
    /// failure returns `Transient`; a store failure aborts the batch with
    /// `StoreUnavailable`. A message is acknowledged to the transport only
    /// after its outcome is recorded, so anything left unrecorded is fetched
    /// again on the next poll.
    pub async fn run_once(
        &self,
        limiter: &mut RateLimiter,
        shutdown: &Shutdown,
    ) -> Result<MailCycleReport, Error> {
        let messages = with_timeout(
            "mail",
            self.call_timeout,
            self.transport.fetch_new_messages(),
        )
        .await?;

        let mut report = MailCycleReport {
            fetched: messages.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for (index, message) in messages.iter().enumerate() {
            if shutdown.is_triggered() {
                report.interrupted = messages.len() - index;
                info!(remaining = report.interrupted, "Mail cycle interrupted by shutdown");
                break;
            }

            if !seen.insert(message.id.as_str()) {
                debug!(message_id = %message.id, "Repeated message in batch dropped");
                report.duplicates += 1;
                continue;
            }
            if self.db.is_processed(&message.id).await? {
                debug!(message_id = %message.id, "Duplicate message dropped");
                report.duplicates += 1;
                self.acknowledge(message).await;
                continue;
            }

            match self.handle(message, limiter).await? {
                MessageOutcome::Replied => report.replied += 1,
                MessageOutcome::Skipped => report.skipped += 1,
                MessageOutcome::Failed | MessageOutcome::InFlight => report.failed += 1,
            }
            self.acknowledge(message).await;
        }

        info!(
            fetched = report.fetched,
            replied = report.replied,
            skipped = report.skipped,
            failed = report.failed,
            duplicates = report.duplicates,
            "Mail cycle complete"
        );
        Ok(report)
    }

    /// Best effort: an unacknowledged message is re-fetched and deduplicated.
    async fn acknowledge(&self, message: &InboundEmail) {
        if let Err(e) = with_timeout(
            "mail",
            self.call_timeout,
            self.transport.mark_handled(message),
        )
        .await
        {
            warn!(message_id = %message.id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn record(
        &self,
        message: &InboundEmail,
        outcome: MessageOutcome,
        detail: Option<&str>,
    ) -> Result<MessageOutcome, Error> {
        self.db
            .record_processed(&message.id, &message.sender, outcome, detail)
            .await?;
        Ok(outcome)
    }

    /// Gate, compose, send and record one new message.
    async fn handle(
        &self,
        message: &InboundEmail,
        limiter: &mut RateLimiter,
    ) -> Result<MessageOutcome, Error> {
        if same_mailbox(&message.sender, &self.own_address) {
            debug!(message_id = %message.id, "Self-sent message skipped");
            return self
                .record(message, MessageOutcome::Skipped, Some("self-sent"))
                .await;
        }

        match self.gate.decide(self.db.as_ref(), message).await? {
            GateDecision::Deny(reason) => {
                info!(message_id = %message.id, sender = %message.sender, reason = reason.as_str(), "Message denied");
                return self
                    .record(message, MessageOutcome::Skipped, Some(reason.as_str()))
                    .await;
            }
            GateDecision::Allow(reason) => {
                debug!(message_id = %message.id, reason = ?reason, "Message admitted");
            }
        }

        self.db.mark_in_flight(&message.id, &message.sender).await?;

        let reply = match self
            .composer
            .compose(message, limiter, self.clock.now())
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Compose failed");
                let detail = format!("compose:{e}");
                return self
                    .record(message, MessageOutcome::Failed, Some(&detail))
                    .await;
            }
        };

        let outbound = OutboundEmail {
            to: message.sender.clone(),
            subject: reply.subject,
            body: reply.body,
            attachments: reply.attachments,
            in_reply_to: Some(message.id.clone()),
        };

        match with_timeout("mail", self.call_timeout, self.transport.send_reply(&outbound)).await {
            Ok(()) => {
                info!(message_id = %message.id, to = %outbound.to, "Reply sent");
                self.record(
                    message,
                    MessageOutcome::Replied,
                    reply.image_skipped.as_deref(),
                )
                .await
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Send failed");
                let detail = format!("send: {e}");
                self.record(message, MessageOutcome::Failed, Some(&detail))
                    .await
            }
        }
    }
}
