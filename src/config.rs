use crate::passcode::MatchPolicy;
use crate::telegram::DEFAULT_API_URL;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub mail: MailConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub passcode: PasscodeConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(deserialize_with = "comma_separated")]
    pub chat_ids: Vec<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub forward_historical: bool,
    #[serde(default)]
    pub mark_forwarded_seen: bool,
    #[serde(default)]
    pub deploy_time_offset_minutes: i64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            forward_historical: false,
            mark_forwarded_seen: false,
            deploy_time_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_senders", deserialize_with = "comma_separated")]
    pub senders: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            senders: default_senders(),
            subject: default_subject(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PasscodeConfig {
    #[serde(default)]
    pub match_policy: MatchPolicy,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControllerConfig {
    pub bot_token: Option<String>,
    #[serde(default, deserialize_with = "comma_separated")]
    pub authorized_users: Vec<String>,
}

// Default polling interval in milliseconds (5 minutes)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300_000;

// Anything shorter would hammer the IMAP server
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_senders() -> Vec<String> {
    vec![
        "disneyplus@mail2.disneyplus.com".to_string(),
        "disneyplus@mail.disneyplus.com".to_string(),
    ]
}

fn default_subject() -> String {
    "Your one-time passcode for Disney+".to_string()
}

/// Accepts either a list or a single comma-separated string, so that
/// `APP_TELEGRAM__CHAT_IDS=1,2` works as well as a TOML array.
fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Joined(String),
    }

    let items = match ListOrString::deserialize(deserializer)? {
        ListOrString::List(items) => items,
        ListOrString::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };

    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

impl AppConfig {
    // Load config from file (if exists), then environment variables
    pub fn new() -> Result<Self, ConfigError> {
        Self::configure_defaults()?
            .add_source(File::with_name("config").required(false))
            // e.g. APP_MAIL__HOST=... APP_TELEGRAM__CHAT_IDS=1,2
            .add_source(Self::environment())
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    // Load config from a specific file path
    pub fn new_from_file(path: &str) -> Result<Self, ConfigError> {
        Self::configure_defaults()?
            .add_source(File::with_name(path).required(true))
            .add_source(Self::environment())
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    fn configure_defaults()
    -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder())
    }

    fn environment() -> Environment {
        Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
    }

    /// Rejects configurations the relay cannot run with.
    fn validated(self) -> Result<Self, ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::Message(
                "telegram.bot_token must not be empty".to_string(),
            ));
        }
        if self.telegram.chat_ids.is_empty() {
            return Err(ConfigError::Message(
                "telegram.chat_ids must list at least one chat".to_string(),
            ));
        }
        if self.filter.senders.is_empty() {
            return Err(ConfigError::Message(
                "filter.senders must list at least one address".to_string(),
            ));
        }
        if self.filter.subject.trim().is_empty() {
            return Err(ConfigError::Message(
                "filter.subject must not be empty".to_string(),
            ));
        }
        Ok(self)
    }

    /// Token used by the control bot, falling back to the notifier's.
    pub fn controller_token(&self) -> &str {
        self.controller
            .bot_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .unwrap_or(&self.telegram.bot_token)
    }
}
