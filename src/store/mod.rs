//! Persistence layer — approved senders, processed messages, social actions.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ActionKind, ActionOutcome, ActionRecord, ApprovalSource, ApprovedSender, Database, Heartbeat,
    MessageOutcome, ProcessedMessage,
};
