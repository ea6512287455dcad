//! Task scheduler — drives the mail and social cycles on jittered intervals.
//!
//! One cooperative loop. Each tick runs every due task to completion, mail
//! first, then records a heartbeat and reschedules it. Failing tasks back off
//! exponentially; a failure streak that reaches the alert threshold mails the
//! admin once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

use crate::channels::{Attachment, MailTransport, OutboundEmail};
use crate::config::{LOG_FILE_NAME, env_or, env_secs, log_dir_from_env};
use crate::error::{ConfigError, Error, with_timeout};
use crate::images::RateLimiter;
use crate::pipeline::MailCycle;
use crate::social::SocialCycle;
use crate::store::{ActionOutcome, Database};
use crate::worker::clock::Clock;
use crate::worker::shutdown::Shutdown;
use crate::worker::state::{SchedulerState, TaskKind, TaskSchedule};

/// Longest accepted interval, jitter or backoff: one year.
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cap on the log tail attached to an alert.
const ALERT_LOG_TAIL_BYTES: usize = 256 * 1024;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mail_interval: Duration,
    pub mail_jitter: Duration,
    pub social_interval: Duration,
    pub social_jitter: Duration,
    /// Upper bound on a backed-off delay (never below the task interval).
    pub max_backoff: Duration,
    /// Consecutive failures after which the admin is alerted.
    pub alert_after_failures: u32,
    /// Bound on sending an alert email.
    pub call_timeout: Duration,
    /// Alert recipient. No alerts when unset.
    pub admin_email: Option<String>,
    /// Rolling log directory; its newest file is attached to alerts.
    pub log_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mail_interval: Duration::from_secs(900),
            mail_jitter: Duration::from_secs(60),
            social_interval: Duration::from_secs(4500),
            social_jitter: Duration::from_secs(900),
            max_backoff: Duration::from_secs(3600),
            alert_after_failures: 3,
            call_timeout: Duration::from_secs(120),
            admin_email: None,
            log_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Load cadence and alerting settings, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            mail_interval: env_secs("MAIL_INTERVAL_SECS", defaults.mail_interval)?,
            mail_jitter: env_secs("MAIL_JITTER_SECS", defaults.mail_jitter)?,
            social_interval: env_secs("SOCIAL_INTERVAL_SECS", defaults.social_interval)?,
            social_jitter: env_secs("SOCIAL_JITTER_SECS", defaults.social_jitter)?,
            max_backoff: env_secs("MAX_BACKOFF_SECS", defaults.max_backoff)?,
            alert_after_failures: env_or("ALERT_AFTER_FAILURES", defaults.alert_after_failures)?,
            call_timeout: env_secs("CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            admin_email: std::env::var("ADMIN_EMAIL")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            log_dir: log_dir_from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero intervals and periods longer than a year.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("MAIL_INTERVAL_SECS", self.mail_interval, false),
            ("MAIL_JITTER_SECS", self.mail_jitter, true),
            ("SOCIAL_INTERVAL_SECS", self.social_interval, false),
            ("SOCIAL_JITTER_SECS", self.social_jitter, true),
            ("MAX_BACKOFF_SECS", self.max_backoff, false),
        ];
        for (key, period, zero_ok) in periods {
            if period > MAX_PERIOD || (period.is_zero() && !zero_ok) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!(
                        "{}s is outside 1..={}s",
                        period.as_secs(),
                        MAX_PERIOD.as_secs()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Log severity for a failed task: transient failures are expected.
fn log_task_error(task: TaskKind, e: &Error) {
    if e.is_transient() {
        warn!(task = task.as_str(), error = %e, "Task failed, will retry");
    } else {
        error!(task = task.as_str(), error = %e, "Task failed");
    }
}

/// The tail of the newest rolling log file in `dir`, if any.
async fn latest_log(dir: &Path) -> std::io::Result<Option<Attachment>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_NAME) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if newest.as_ref().is_none_or(|(seen, _)| modified > *seen) {
            newest = Some((modified, entry.path()));
        }
    }
    let Some((_, path)) = newest else {
        return Ok(None);
    };

    let data = tokio::fs::read(&path).await?;
    let tail = data[data.len().saturating_sub(ALERT_LOG_TAIL_BYTES)..].to_vec();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| LOG_FILE_NAME.to_string());
    Ok(Some(Attachment {
        filename,
        content_type: "text/plain".to_string(),
        data: tail,
    }))
}

/// Result of running one task within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub task: TaskKind,
    /// Short outcome label, also written to the heartbeat row.
    pub outcome: String,
    pub failed: bool,
    pub consecutive_failures: u32,
    /// Whether this run triggered an admin alert.
    pub alerted: bool,
}

/// Drives both cycles until shutdown.
pub struct Scheduler {
    db: Arc<dyn Database>,
    mail: MailCycle,
    social: Option<SocialCycle>,
    /// Used only for admin alerts.
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    rng: StdRng,
    state: SchedulerState,
}

impl Scheduler {
    /// Build a scheduler whose tasks are all due immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        mail: MailCycle,
        social: Option<SocialCycle>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        image_limiter: RateLimiter,
        config: SchedulerConfig,
        seed: Option<u64>,
    ) -> Self {
        let now = clock.now();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SchedulerState {
            mail: TaskSchedule::new(config.mail_interval, config.mail_jitter, now),
            social: social
                .as_ref()
                .map(|_| TaskSchedule::new(config.social_interval, config.social_jitter, now)),
            image_limiter,
        };
        Self {
            db,
            mail,
            social,
            transport,
            clock,
            config,
            rng,
            state,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Run every due task once, mail first. Stops early on shutdown.
    pub async fn tick(&mut self, shutdown: &Shutdown) -> Vec<TaskRun> {
        let mut runs = Vec::new();
        for task in [TaskKind::Mail, TaskKind::Social] {
            if shutdown.is_triggered() {
                break;
            }
            let now = self.clock.now();
            let due = self
                .state
                .schedule(task)
                .is_some_and(|schedule| schedule.is_due(now));
            if due {
                runs.push(self.run_task(task, shutdown).await);
            }
        }
        runs
    }

    async fn run_task(&mut self, task: TaskKind, shutdown: &Shutdown) -> TaskRun {
        debug!(task = task.as_str(), "Running task");
        let (outcome, failed) = match task {
            TaskKind::Mail => match self
                .mail
                .run_once(&mut self.state.image_limiter, shutdown)
                .await
            {
                Ok(_) => ("ok".to_string(), false),
                Err(e) => {
                    log_task_error(task, &e);
                    ("error".to_string(), true)
                }
            },
            TaskKind::Social => match &self.social {
                Some(social) => match social.run_once(&mut self.rng).await {
                    Ok(ActionOutcome::Failed) => (ActionOutcome::Failed.to_string(), true),
                    Ok(outcome) => (outcome.to_string(), false),
                    Err(e) => {
                        log_task_error(task, &e);
                        ("error".to_string(), true)
                    }
                },
                None => ("disabled".to_string(), false),
            },
        };

        let now = self.clock.now();
        let max_backoff = self.config.max_backoff;
        let mut consecutive_failures = 0;
        if let Some(schedule) = self.state.schedule_mut(task) {
            if failed {
                consecutive_failures = schedule.record_failure(now, max_backoff, &mut self.rng);
            } else {
                schedule.record_success(now, max_backoff, &mut self.rng);
            }
            debug!(task = task.as_str(), next_due = %schedule.next_due, "Task rescheduled");
        }

        if let Err(e) = self
            .db
            .record_heartbeat(task.as_str(), &outcome, consecutive_failures)
            .await
        {
            warn!(task = task.as_str(), error = %e, "Failed to record heartbeat");
        }

        let alerted = failed
            && self.config.alert_after_failures > 0
            && consecutive_failures == self.config.alert_after_failures
            && self.send_alert(task, &outcome, consecutive_failures).await;

        TaskRun {
            task,
            outcome,
            failed,
            consecutive_failures,
            alerted,
        }
    }

    /// Mail the admin about a failure streak. Returns whether it was sent.
    async fn send_alert(&self, task: TaskKind, outcome: &str, failures: u32) -> bool {
        let Some(admin) = self.config.admin_email.as_deref() else {
            warn!(task = task.as_str(), failures, "Task failing and no admin address configured");
            return false;
        };

        let mut attachments = Vec::new();
        if let Some(dir) = self.config.log_dir.as_deref() {
            match latest_log(dir).await {
                Ok(Some(log)) => attachments.push(log),
                Ok(None) => debug!(dir = %dir.display(), "No log file to attach"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to read log for alert"),
            }
        }

        let alert = OutboundEmail {
            to: admin.to_string(),
            subject: format!("[inbox-agent] {task} task failing"),
            body: format!(
                "The {task} task has failed {failures} times in a row.\n\
                 Last outcome: {outcome}\n\
                 It will keep retrying with backoff."
            ),
            attachments,
            in_reply_to: None,
        };

        match with_timeout("mail", self.config.call_timeout, self.transport.send_reply(&alert)).await {
            Ok(()) => {
                info!(task = task.as_str(), failures, "Admin alerted");
                true
            }
            Err(e) => {
                warn!(task = task.as_str(), error = %e, "Failed to send admin alert");
                false
            }
        }
    }

    /// Loop until shutdown. An in-flight task always runs to completion.
    pub async fn run(mut self, shutdown: Shutdown) {
        info!(
            social_enabled = self.social.is_some(),
            mail_interval_secs = self.config.mail_interval.as_secs(),
            "Scheduler started"
        );

        while !shutdown.is_triggered() {
            self.tick(&shutdown).await;
            if shutdown.is_triggered() {
                break;
            }

            let wait = (self.state.next_wake() - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(wait_secs = wait.as_secs(), "Sleeping until next task");
            tokio::select! {
                _ = self.clock.sleep(wait) => {}
                _ = shutdown.wait() => break,
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::channels::InboundEmail;
    use crate::error::ExternalError;
    use crate::images::{GeneratedImage, ImageCaptioner, ImageGenerator};
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::pipeline::{AdmissionGate, ComposerConfig, ResponseComposer};
    use crate::store::LibSqlBackend;
    use crate::worker::clock::ManualClock;

    /// Fetch fails while `failing` is set; sends are captured.
    #[derive(Default)]
    struct FlakyTransport {
        failing: Mutex<bool>,
        fetches: AtomicUsize,
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl MailTransport for FlakyTransport {
        async fn fetch_new_messages(&self) -> Result<Vec<InboundEmail>, ExternalError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if *self.failing.lock().unwrap() {
                Err(ExternalError::request("mail", "connection refused"))
            } else {
                Ok(vec![])
            }
        }

        async fn send_reply(&self, email: &OutboundEmail) -> Result<(), ExternalError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }

        async fn mark_handled(&self, _message: &InboundEmail) -> Result<(), ExternalError> {
            Ok(())
        }
    }

    struct QuietLlm;

    #[async_trait]
    impl LlmProvider for QuietLlm {
        fn model_name(&self) -> &str {
            "quiet"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, ExternalError> {
            Ok(CompletionResponse {
                content: "hello".into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    struct NoImages;

    #[async_trait]
    impl ImageCaptioner for NoImages {
        async fn caption(&self, _image: &[u8]) -> Result<String, ExternalError> {
            Err(ExternalError::request("captioner", "unused"))
        }
    }

    #[async_trait]
    impl ImageGenerator for NoImages {
        async fn generate_image(&self, _prompt: &str) -> Result<GeneratedImage, ExternalError> {
            Err(ExternalError::request("image-generator", "unused"))
        }
    }

    async fn scheduler(
        transport: Arc<FlakyTransport>,
        clock: Arc<ManualClock>,
        admin: Option<&str>,
    ) -> (Scheduler, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let composer = ResponseComposer::new(
            Arc::new(QuietLlm),
            Arc::new(NoImages),
            Arc::new(NoImages),
            ComposerConfig::default(),
        );
        let mail = MailCycle::new(
            db.clone(),
            transport.clone(),
            AdmissionGate::new(""),
            composer,
            clock.clone(),
            "agent@example.com",
            Duration::from_secs(5),
        );
        let config = SchedulerConfig {
            mail_interval: Duration::from_secs(100),
            mail_jitter: Duration::ZERO,
            max_backoff: Duration::from_secs(1000),
            alert_after_failures: 2,
            admin_email: admin.map(String::from),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            db.clone(),
            mail,
            None,
            transport,
            clock,
            RateLimiter::new(1, Duration::from_secs(60)),
            config,
            Some(7),
        );
        (scheduler, db)
    }

    #[tokio::test]
    async fn mail_runs_once_per_interval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        let (mut scheduler, db) = scheduler(transport.clone(), clock.clone(), None).await;
        let shutdown = Shutdown::new();

        let runs = scheduler.tick(&shutdown).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, "ok");

        assert!(scheduler.tick(&shutdown).await.is_empty());
        clock.advance(Duration::from_secs(100));
        assert_eq!(scheduler.tick(&shutdown).await.len(), 1);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);

        let heartbeat = db.get_heartbeat("mail").await.unwrap().unwrap();
        assert_eq!(heartbeat.last_outcome, "ok");
        assert_eq!(heartbeat.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failures_back_off_and_alert_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        *transport.failing.lock().unwrap() = true;
        let (mut scheduler, _db) =
            scheduler(transport.clone(), clock.clone(), Some("admin@example.com")).await;
        let shutdown = Shutdown::new();

        let first = scheduler.tick(&shutdown).await;
        assert!(first[0].failed);
        assert!(!first[0].alerted);
        assert_eq!(
            scheduler.state().mail.next_due - clock.now(),
            chrono::Duration::seconds(200)
        );

        clock.advance(Duration::from_secs(200));
        let second = scheduler.tick(&shutdown).await;
        assert_eq!(second[0].consecutive_failures, 2);
        assert!(second[0].alerted);

        clock.advance(Duration::from_secs(400));
        let third = scheduler.tick(&shutdown).await;
        assert!(!third[0].alerted);

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "admin@example.com");
        assert_eq!(sent[0].subject, "[inbox-agent] mail task failing");

        *transport.failing.lock().unwrap() = false;
        clock.advance(Duration::from_secs(800));
        let recovered = scheduler.tick(&shutdown).await;
        assert!(!recovered[0].failed);
        assert_eq!(scheduler.state().mail.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn shutdown_skips_due_tasks() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        let (mut scheduler, _db) = scheduler(transport.clone(), clock, None).await;
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert!(scheduler.tick(&shutdown).await.is_empty());
        scheduler.run(shutdown).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_sleeps_until_next_due() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        let (scheduler, _db) = scheduler(transport.clone(), clock.clone(), None).await;
        let shutdown = Shutdown::new();

        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        while transport.fetches.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        shutdown.trigger();
        handle.await.unwrap();

        let sleeps = clock.sleeps();
        assert!(sleeps.len() >= 2);
        assert_eq!(sleeps[0], Duration::from_secs(100));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn run_future_is_send() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        let (scheduler, _db) = scheduler(transport, clock, None).await;
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let run = scheduler.run(shutdown);
        assert_send(&run);
        run.await;
    }

    #[tokio::test]
    async fn alert_attaches_newest_log_file() {
        let logs = tempfile::tempdir().unwrap();
        std::fs::write(logs.path().join("unrelated.txt"), "ignore me").unwrap();
        std::fs::write(logs.path().join("inbox-agent.log.2026-01-01"), "old day").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(
            logs.path().join("inbox-agent.log.2026-01-02"),
            "ERROR mail fetch failed",
        )
        .unwrap();

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        *transport.failing.lock().unwrap() = true;
        let (mut scheduler, _db) =
            scheduler(transport.clone(), clock.clone(), Some("admin@example.com")).await;
        scheduler.config.log_dir = Some(logs.path().to_path_buf());
        let shutdown = Shutdown::new();

        scheduler.tick(&shutdown).await;
        clock.advance(Duration::from_secs(200));
        assert!(scheduler.tick(&shutdown).await[0].alerted);

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent[0].attachments.len(), 1);
        let log = &sent[0].attachments[0];
        assert_eq!(log.filename, "inbox-agent.log.2026-01-02");
        assert_eq!(log.content_type, "text/plain");
        assert_eq!(log.data, b"ERROR mail fetch failed");
    }

    #[tokio::test]
    async fn alert_without_log_dir_has_no_attachment() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(FlakyTransport::default());
        *transport.failing.lock().unwrap() = true;
        let (mut scheduler, _db) =
            scheduler(transport.clone(), clock.clone(), Some("admin@example.com")).await;
        let shutdown = Shutdown::new();

        scheduler.tick(&shutdown).await;
        clock.advance(Duration::from_secs(200));
        scheduler.tick(&shutdown).await;

        assert!(transport.sent.lock().unwrap()[0].attachments.is_empty());
    }

    #[test]
    fn validate_rejects_out_of_range_periods() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let huge = SchedulerConfig {
            mail_interval: Duration::from_secs(u64::MAX),
            ..SchedulerConfig::default()
        };
        match huge.validate().unwrap_err() {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "MAIL_INTERVAL_SECS"),
            other => panic!("unexpected error: {other}"),
        }

        let zero = SchedulerConfig {
            social_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(zero.validate().is_err());

        let no_jitter = SchedulerConfig {
            mail_jitter: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(no_jitter.validate().is_ok());
    }

    #[test]
    fn config_defaults_match_documented_cadence() {
        let config = SchedulerConfig::default();
        assert_eq!(config.mail_interval, Duration::from_secs(900));
        assert_eq!(config.social_interval, Duration::from_secs(4500));
        assert_eq!(config.max_backoff, Duration::from_secs(3600));
        assert_eq!(config.alert_after_failures, 3);
    }
}
