//! IMAP/SMTP mail transport — raw IMAP over rustls for inbound, lettre for outbound.
//!
//! Both directions are blocking and run inside `spawn_blocking`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::email_types::{Attachment, InboundEmail, OutboundEmail};
use crate::channels::transport::MailTransport;
use crate::error::{ConfigError, ExternalError};

const SERVICE: &str = "mail";

// ── Configuration ───────────────────────────────────────────────────

/// Mail account configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// The agent's own address; also used to recognise self-sent mail.
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables. `EMAIL_IMAP_HOST` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_IMAP_HOST".to_string()))?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        if from_address.is_empty() {
            return Err(ConfigError::MissingEnvVar("EMAIL_FROM_ADDRESS".to_string()));
        }

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// IMAP polling (inbound) + SMTP (outbound).
pub struct ImapSmtpTransport {
    config: EmailConfig,
}

impl ImapSmtpTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailTransport for ImapSmtpTransport {
    async fn fetch_new_messages(&self) -> Result<Vec<InboundEmail>, ExternalError> {
        let cfg = self.config.clone();
        let messages = tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| ExternalError::request(SERVICE, format!("IMAP task panicked: {e}")))?
            .map_err(|e| ExternalError::request(SERVICE, format!("IMAP fetch failed: {e}")))?;

        debug!(count = messages.len(), host = %self.config.imap_host, "Fetched unseen mail");
        Ok(messages)
    }

    async fn mark_handled(&self, message: &InboundEmail) -> Result<(), ExternalError> {
        let Some(uid) = message.uid else {
            debug!(message_id = %message.id, "No IMAP UID, nothing to flag");
            return Ok(());
        };
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || flag_seen_imap(&cfg, uid))
            .await
            .map_err(|e| ExternalError::request(SERVICE, format!("IMAP task panicked: {e}")))?
            .map_err(|e| ExternalError::request(SERVICE, format!("IMAP store failed: {e}")))
    }

    async fn send_reply(&self, email: &OutboundEmail) -> Result<(), ExternalError> {
        let cfg = self.config.clone();
        let email = email.clone();
        tokio::task::spawn_blocking(move || send_email(&cfg, &email))
            .await
            .map_err(|e| ExternalError::request(SERVICE, format!("SMTP task panicked: {e}")))?
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Build the lettre message for `email`.
fn build_message(from: &str, email: &OutboundEmail) -> Result<Message, ExternalError> {
    let mut builder = Message::builder()
        .from(
            from.parse()
                .map_err(|e| ExternalError::request(SERVICE, format!("Invalid from address: {e}")))?,
        )
        .to(email
            .to
            .parse()
            .map_err(|e| ExternalError::request(SERVICE, format!("Invalid to address: {e}")))?)
        .subject(email.subject.clone());

    if let Some(id) = &email.in_reply_to {
        builder = builder.in_reply_to(id.clone()).references(id.clone());
    }

    let result = if email.attachments.is_empty() {
        builder.body(email.body.clone())
    } else {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(email.body.clone()));
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| {
                    ExternalError::request(SERVICE, format!("Invalid content type: {e}"))
                })?;
            parts = parts.singlepart(
                MailAttachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(parts)
    };

    result.map_err(|e| ExternalError::request(SERVICE, format!("Failed to build email: {e}")))
}

/// Send an email via SMTP (blocking).
fn send_email(config: &EmailConfig, email: &OutboundEmail) -> Result<(), ExternalError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| ExternalError::request(SERVICE, format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let message = build_message(&config.from_address, email)?;

    transport
        .send(&message)
        .map_err(|e| ExternalError::request(SERVICE, format!("SMTP send failed: {e}")))?;

    info!(to = %email.to, attachments = email.attachments.len(), "Email sent");
    Ok(())
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Collect every non-inline-text attachment with its MIME type.
fn extract_attachments(parsed: &mail_parser::Message) -> Vec<Attachment> {
    parsed
        .attachments()
        .filter_map(|part| {
            let ct = MimeHeaders::content_type(part)?;
            let content_type = match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            };
            let filename = MimeHeaders::attachment_name(part)
                .unwrap_or("attachment")
                .to_string();
            Some(Attachment {
                filename,
                content_type: content_type.to_ascii_lowercase(),
                data: part.contents().to_vec(),
            })
        })
        .collect()
}

/// Parse one raw RFC 822 message.
///
/// Without a Message-ID header the id is a name-based UUID of the raw bytes,
/// so the same message gets the same id on every poll.
pub fn parse_message(raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, raw)));

    let received_at = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        id,
        uid: None,
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(&parsed),
        attachments: extract_attachments(&parsed),
        received_at,
    })
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Error type for IMAP fetch operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// UIDs from `* SEARCH` response lines.
fn parse_search_response(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2))
        .filter_map(|uid| uid.parse().ok())
        .collect()
}

/// The message literal of a `FETCH` response: everything between the
/// untagged header line and the closing parenthesis.
fn fetch_literal(lines: &[String]) -> String {
    let mut body = lines.get(1..lines.len().saturating_sub(1)).unwrap_or_default();
    if body.last().is_some_and(|l| l.trim_end() == ")") {
        body = &body[..body.len() - 1];
    }
    body.concat()
}

fn tagged_ok(lines: &[String], tag: &str) -> bool {
    lines
        .last()
        .and_then(|l| l.strip_prefix(tag))
        .is_some_and(|rest| rest.trim_start().starts_with("OK"))
}

/// A logged-in IMAP connection with INBOX selected.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls_pki_types::ServerName<'_> =
            rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let mut tls = rustls::StreamOwned::new(conn, tcp);

        let _greeting = read_line(&mut tls)?;
        let mut session = Self { tls, next_tag: 1 };

        let login = format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        );
        if !session.command_ok(&login)? {
            return Err("IMAP login failed".into());
        }
        if !session.command_ok("SELECT \"INBOX\"")? {
            return Err("IMAP select failed".into());
        }
        Ok(session)
    }

    fn command(&mut self, cmd: &str) -> Result<(String, Vec<String>), ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        let lines = send_cmd(&mut self.tls, &tag, cmd)?;
        Ok((tag, lines))
    }

    fn command_ok(&mut self, cmd: &str) -> Result<bool, ImapError> {
        let (tag, lines) = self.command(cmd)?;
        Ok(tagged_ok(&lines, &tag))
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Fetch unseen emails via raw IMAP over TLS (blocking — run in spawn_blocking).
///
/// Bodies are read with `BODY.PEEK[]`, which leaves `\Seen` unset; a message
/// is only flagged by [`flag_seen_imap`] once its outcome is recorded.
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<InboundEmail>, ImapError> {
    let mut session = ImapSession::open(config)?;

    let (_, search_resp) = session.command("UID SEARCH UNSEEN")?;
    let uids = parse_search_response(&search_resp);

    let mut results = Vec::new();
    for uid in uids {
        let (tag, fetch_resp) = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !tagged_ok(&fetch_resp, &tag) {
            warn!(uid, "IMAP fetch rejected, skipping message");
            continue;
        }
        match parse_message(fetch_literal(&fetch_resp).as_bytes()) {
            Some(mut email) => {
                email.uid = Some(uid);
                results.push(email);
            }
            None => warn!(uid, "Unparseable message skipped"),
        }
    }

    session.logout();
    Ok(results)
}

/// Flag one message `\Seen` by UID (blocking).
fn flag_seen_imap(config: &EmailConfig, uid: u32) -> Result<(), ImapError> {
    let mut session = ImapSession::open(config)?;
    let flagged = session.command_ok(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
    session.logout();
    if !flagged {
        return Err(format!("server refused to flag UID {uid}").into());
    }
    debug!(uid, "Message flagged seen");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
