//! Admission gate — decides whether an inbound message may be answered.

use tracing::info;

use crate::channels::InboundEmail;
use crate::error::DatabaseError;
use crate::store::{ApprovalSource, Database};

/// Why a message was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    AlreadyApproved,
    /// The body carried the approval phrase; the sender is now approved.
    ApprovalPhrase,
}

/// Why a message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SenderNotApproved,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SenderNotApproved => "sender-not-approved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow(AllowReason),
    Deny(DenyReason),
}

/// Approve-list gate with phrase-based self-enrolment.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    /// Lower-cased; empty disables phrase matching.
    approval_phrase: String,
}

impl AdmissionGate {
    pub fn new(approval_phrase: &str) -> Self {
        Self {
            approval_phrase: approval_phrase.trim().to_lowercase(),
        }
    }

    fn carries_phrase(&self, body: &str) -> bool {
        !self.approval_phrase.is_empty() && body.to_lowercase().contains(&self.approval_phrase)
    }

    /// Decide admission for one message. A phrase match persists the approval.
    pub async fn decide(
        &self,
        db: &dyn Database,
        message: &InboundEmail,
    ) -> Result<GateDecision, DatabaseError> {
        if db.is_approved(&message.sender).await? {
            return Ok(GateDecision::Allow(AllowReason::AlreadyApproved));
        }

        if self.carries_phrase(&message.body) {
            db.record_approval(&message.sender, ApprovalSource::Phrase)
                .await?;
            info!(sender = %message.sender, message_id = %message.id, "Sender approved by phrase");
            return Ok(GateDecision::Allow(AllowReason::ApprovalPhrase));
        }

        Ok(GateDecision::Deny(DenyReason::SenderNotApproved))
    }
}
