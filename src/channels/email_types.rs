//! Email-specific types — inbound/outbound messages, quote stripping, address comparison.

use chrono::{DateTime, Utc};

/// A file attached to an email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    /// MIME type, e.g. `image/png`.
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with("image/")
    }
}

/// A message fetched from the inbox.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    /// Message-ID header, or a stand-in derived from the raw bytes when the
    /// header is missing.
    pub id: String,
    /// IMAP UID, used to acknowledge the message once handled.
    pub uid: Option<u32>,
    /// Bare sender address.
    pub sender: String,
    pub subject: String,
    /// Plain-text body (HTML bodies are stripped to text).
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

impl InboundEmail {
    /// The first image attachment, if any.
    pub fn first_image(&self) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.is_image())
    }
}

/// A message to be sent.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Message-ID being answered, sent as `In-Reply-To`.
    pub in_reply_to: Option<String>,
}

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - "On ... wrote:" attribution lines and everything after them
/// - "--- Original Message ---" separators and everything after them
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n").trim_start_matches('\n').to_string()
}

/// Subject line for a reply: prefixes `Re: ` unless already present.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.len() >= 3 && subject[..3].eq_ignore_ascii_case("re:") {
        subject.to_string()
    } else if subject.is_empty() {
        "Re: (no subject)".to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Whether two addresses name the same mailbox.
///
/// Case-insensitive, and dots in the local part are ignored
/// (`first.last@host` and `firstlast@host` deliver to the same inbox).
pub fn same_mailbox(a: &str, b: &str) -> bool {
    fn canonical(addr: &str) -> Option<String> {
        let addr = addr.trim().to_lowercase();
        let (local, domain) = addr.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(format!("{}@{domain}", local.replace('.', "")))
    }
    match (canonical(a), canonical(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── strip_quoted_text tests ─────────────────────────────────

    #[test]
    fn strip_basic_quoted_lines() {
        let body = "Hello!\n\n> This is quoted\n> Another quoted line\nThanks";
        assert_eq!(strip_quoted_text(body), "Hello!\n\nThanks");
    }

    #[test]
    fn strip_on_wrote_attribution() {
        let body = "Sounds good!\n\nOn Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:\n> Original message";
        assert_eq!(strip_quoted_text(body), "Sounds good!");
    }

    #[test]
    fn strip_original_message_separator() {
        let body = "My reply\n\n--- Original Message ---\nOld stuff here";
        assert_eq!(strip_quoted_text(body), "My reply");
    }

    #[test]
    fn strip_no_quotes() {
        let body = "Just a normal message\nWith multiple lines";
        assert_eq!(strip_quoted_text(body), body);
    }

    #[test]
    fn strip_empty_input() {
        assert_eq!(strip_quoted_text(""), "");
    }

    // ── reply_subject tests ─────────────────────────────────────

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Lunch?"), "Re: Lunch?");
        assert_eq!(reply_subject("Re: Lunch?"), "Re: Lunch?");
        assert_eq!(reply_subject("RE: Lunch?"), "RE: Lunch?");
        assert_eq!(reply_subject("  "), "Re: (no subject)");
    }

    // ── same_mailbox tests ──────────────────────────────────────

    #[test]
    fn same_mailbox_ignores_dots_and_case() {
        assert!(same_mailbox("Agent.Bot@Example.com", "agentbot@example.com"));
        assert!(same_mailbox("a.b.c@x.io", "abc@x.io"));
        assert!(!same_mailbox("agent@example.com", "agent@example.org"));
        assert!(!same_mailbox("agent@host.example.com", "agent@hostexample.com"));
    }

    #[test]
    fn same_mailbox_rejects_malformed() {
        assert!(!same_mailbox("unknown", "unknown"));
        assert!(!same_mailbox("", "a@b.c"));
    }

    #[test]
    fn first_image_skips_non_images() {
        let msg = InboundEmail {
            id: "<1@x>".into(),
            uid: None,
            sender: "a@x.com".into(),
            subject: "pics".into(),
            body: String::new(),
            attachments: vec![
                Attachment {
                    filename: "notes.txt".into(),
                    content_type: "text/plain".into(),
                    data: b"hi".to_vec(),
                },
                Attachment {
                    filename: "cat.JPG".into(),
                    content_type: "Image/JPEG".into(),
                    data: vec![0xff, 0xd8],
                },
            ],
            received_at: Utc::now(),
        };
        assert_eq!(msg.first_image().unwrap().filename, "cat.JPG");
    }
}
