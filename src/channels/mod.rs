//! Mail I/O — the transport trait and its IMAP/SMTP implementation.

pub mod email;
pub mod email_types;
pub mod transport;

pub use email::{EmailConfig, ImapSmtpTransport};
pub use email_types::{Attachment, InboundEmail, OutboundEmail};
pub use transport::MailTransport;
