//! `MailTransport` trait — inbox polling and reply delivery.

use async_trait::async_trait;

use crate::channels::email_types::{InboundEmail, OutboundEmail};
use crate::error::ExternalError;

/// A mail account the agent reads from and replies through.
///
/// Implementations report failures under the `mail` service name.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Fetch messages not yet acknowledged, in arrival order.
    ///
    /// Fetching does not consume a message: it is returned again on every
    /// poll until [`mark_handled`](Self::mark_handled) succeeds. Callers
    /// deduplicate by [`InboundEmail::id`].
    async fn fetch_new_messages(&self) -> Result<Vec<InboundEmail>, ExternalError>;

    /// Deliver one message.
    async fn send_reply(&self, email: &OutboundEmail) -> Result<(), ExternalError>;

    /// Acknowledge a message whose outcome has been recorded.
    async fn mark_handled(&self, message: &InboundEmail) -> Result<(), ExternalError>;
}
