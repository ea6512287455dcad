//! Configuration types.
//!
//! Everything is read from the environment once at startup. Each collaborator
//! owns its own `from_env()`; `AgentConfig` gathers them with the agent-level
//! settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::channels::EmailConfig;
use crate::error::ConfigError;
use crate::images::HuggingFaceConfig;
use crate::llm::LlmConfig;
use crate::pipeline::ComposerConfig;
use crate::social::{MoltbookConfig, SocialConfig};
use crate::worker::SchedulerConfig;

/// Parse `raw` as `T`, or return `default` when unset or blank.
pub(crate) fn parse_or<T>(key: &str, raw: Option<&str>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        }),
        None => Ok(default),
    }
}

/// Read `key` from the environment and parse it, falling back to `default`.
pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_or(key, std::env::var(key).ok().as_deref(), default)
}

/// Parse a whole number of seconds, falling back to `default`.
pub(crate) fn parse_secs(
    key: &str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(key, raw, default.as_secs()).map(Duration::from_secs)
}

/// Read a whole number of seconds from `key`.
pub(crate) fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_secs(key, std::env::var(key).ok().as_deref(), default)
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub(crate) fn parse_flag(key: &str, raw: Option<&str>, default: bool) -> Result<bool, ConfigError> {
    match raw.map(|v| v.trim().to_ascii_lowercase()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{v}' is not a boolean"),
            }),
        },
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Database location from `AGENT_DB_PATH`.
pub fn db_path_from_env() -> PathBuf {
    env_string("AGENT_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./data/inbox-agent.db"))
}

/// File name prefix of the daily rolling log.
pub const LOG_FILE_NAME: &str = "inbox-agent.log";

/// Log directory from `AGENT_LOG_DIR`.
pub fn log_dir_from_env() -> Option<PathBuf> {
    env_string("AGENT_LOG_DIR").map(PathBuf::from)
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub email: EmailConfig,
    pub llm: LlmConfig,
    pub images: HuggingFaceConfig,
    /// Present only when the social task is enabled.
    pub moltbook: Option<MoltbookConfig>,
    pub scheduler: SchedulerConfig,
    pub social: SocialConfig,
    pub composer: ComposerConfig,
    /// Seeded as approved at startup and receives failure alerts.
    pub admin_email: Option<String>,
    /// Extra address seeded as approved at startup.
    pub test_email: Option<String>,
    /// Empty disables phrase approval.
    pub approval_phrase: String,
    pub db_path: PathBuf,
    /// Image generations allowed per window.
    pub image_quota: u32,
    pub image_window: Duration,
    /// Fixed RNG seed; random when unset.
    pub seed: Option<u64>,
    /// Bound on each mail-task call; defaults to `CALL_TIMEOUT_SECS`.
    pub mail_call_timeout: Duration,
}

impl AgentConfig {
    /// Build the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let email = EmailConfig::from_env()?;
        let llm = LlmConfig::from_env()?;
        let scheduler = SchedulerConfig::from_env()?;

        let mail_call_timeout = env_secs("MAIL_CALL_TIMEOUT_SECS", scheduler.call_timeout)?;
        let social_call_timeout = env_secs("SOCIAL_CALL_TIMEOUT_SECS", scheduler.call_timeout)?;

        let moltbook = MoltbookConfig::from_env();
        let social_enabled = parse_flag(
            "SOCIAL_ENABLED",
            std::env::var("SOCIAL_ENABLED").ok().as_deref(),
            moltbook.is_some(),
        )?;
        if social_enabled && moltbook.is_none() {
            return Err(ConfigError::MissingEnvVar("MOLTBOOK_API_KEY".to_string()));
        }
        let moltbook = moltbook.filter(|_| social_enabled);

        let social_defaults = SocialConfig::default();
        let social = SocialConfig {
            cooldown: env_secs("SOCIAL_COOLDOWN_SECS", social_defaults.cooldown)?,
            max_actions_per_day: env_or(
                "SOCIAL_MAX_ACTIONS_PER_DAY",
                social_defaults.max_actions_per_day,
            )?,
            call_timeout: social_call_timeout,
            max_tokens: social_defaults.max_tokens,
        };

        let composer = ComposerConfig {
            max_tokens: llm.max_tokens,
            call_timeout: mail_call_timeout,
            ..ComposerConfig::default()
        };

        Ok(Self {
            email,
            llm,
            images: HuggingFaceConfig::from_env(),
            moltbook,
            admin_email: scheduler.admin_email.clone(),
            scheduler,
            social,
            composer,
            test_email: env_string("TEST_EMAIL"),
            approval_phrase: std::env::var("APPROVAL_PHRASE").unwrap_or_default(),
            db_path: db_path_from_env(),
            image_quota: env_or("IMAGE_QUOTA", 5)?,
            image_window: env_secs("IMAGE_WINDOW_SECS", Duration::from_secs(86_400))?,
            seed: env_string("AGENT_SEED")
                .map(|raw| parse_or("AGENT_SEED", Some(raw.as_str()), 0u64))
                .transpose()?,
            mail_call_timeout,
        })
    }

    /// Addresses approved on every startup.
    pub fn seeded_approvals(&self) -> Vec<&str> {
        self.admin_email
            .iter()
            .chain(self.test_email.iter())
            .map(String::as_str)
            .collect()
    }
}
