use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_agent::channels::ImapSmtpTransport;
use inbox_agent::config::{self, AgentConfig};
use inbox_agent::images::{HuggingFaceClient, RateLimiter};
use inbox_agent::llm::create_provider;
use inbox_agent::pipeline::{AdmissionGate, MailCycle, ResponseComposer};
use inbox_agent::social::{MoltbookClient, SocialCycle};
use inbox_agent::store::{ApprovalSource, Database, LibSqlBackend};
use inbox_agent::worker::{Scheduler, Shutdown, SystemClock};

const USAGE: &str = "usage: inbox-agent [approve <address> | list-approved]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(config::log_dir_from_env().as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {}
        Some("approve") => {
            let Some(address) = args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            approve(address).await?;
            return Ok(());
        }
        Some("list-approved") => {
            list_approved().await?;
            return Ok(());
        }
        Some(_) => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    let config = AgentConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📬 Inbox Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}", config.email.from_address);
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    for address in config.seeded_approvals() {
        db.record_approval(address, ApprovalSource::Admin).await?;
    }

    // ── Startup recovery: replies that may have been cut off mid-send ───
    let recovered = db.recover_in_flight().await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted messages (marked failed)");
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let transport = Arc::new(ImapSmtpTransport::new(config.email.clone()));
    let images = Arc::new(HuggingFaceClient::new(config.images.clone()));
    let clock = Arc::new(SystemClock);

    let composer = ResponseComposer::new(
        llm.clone(),
        images.clone(),
        images,
        config.composer.clone(),
    );
    let mail = MailCycle::new(
        Arc::clone(&db),
        transport.clone(),
        AdmissionGate::new(&config.approval_phrase),
        composer,
        clock.clone(),
        &config.email.from_address,
        config.mail_call_timeout,
    );

    let social = config.moltbook.clone().map(|moltbook| {
        eprintln!("   Moltbook: enabled (submolt: {})", moltbook.submolt);
        SocialCycle::new(
            Arc::clone(&db),
            Arc::new(MoltbookClient::new(moltbook)),
            llm.clone(),
            config.social.clone(),
        )
    });
    if social.is_none() {
        eprintln!("   Moltbook: disabled");
    }
    eprintln!(
        "   Images: {} per {}s\n",
        config.image_quota,
        config.image_window.as_secs()
    );

    let scheduler = Scheduler::new(
        Arc::clone(&db),
        mail,
        social,
        transport,
        clock,
        RateLimiter::new(config.image_quota, config.image_window),
        config.scheduler.clone(),
        config.seed,
    );

    // ── Signals ──────────────────────────────────────────────────────────
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Signal received, finishing current work");
            shutdown.trigger();
        });
    }

    scheduler.run(shutdown).await;
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, config::LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, using Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn open_store() -> anyhow::Result<LibSqlBackend> {
    let path = config::db_path_from_env();
    LibSqlBackend::new_local(&path)
        .await
        .with_context(|| format!("opening database at {}", path.display()))
}

async fn approve(address: &str) -> anyhow::Result<()> {
    let db = open_store().await?;
    db.record_approval(address, ApprovalSource::Admin)
        .await
        .with_context(|| format!("approving {address}"))?;
    println!("approved {}", address.trim().to_lowercase());
    Ok(())
}

async fn list_approved() -> anyhow::Result<()> {
    let db = open_store().await?;
    let approved = db.list_approved().await.context("listing approved senders")?;
    for sender in approved {
        println!(
            "{}\t{}\t{}",
            sender.sender,
            sender.source.as_str(),
            sender.added_at.to_rfc3339()
        );
    }
    Ok(())
}
