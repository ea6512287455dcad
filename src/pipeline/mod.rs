//! Inbound mail pipeline — admission gate, reply composer, and the mail cycle.

pub mod composer;
pub mod gate;
pub mod mail_cycle;

pub use composer::{ComposedReply, ComposerConfig, ResponseComposer};
pub use gate::{AdmissionGate, AllowReason, DenyReason, GateDecision};
pub use mail_cycle::{MailCycle, MailCycleReport};
