//! Inbox agent — answers approved senders by email and takes part in Moltbook.

pub mod channels;
pub mod config;
pub mod error;
pub mod images;
pub mod llm;
pub mod pipeline;
pub mod social;
pub mod store;
pub mod worker;
