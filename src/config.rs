use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::household::binding::ControlPattern;
use crate::household::composer::Composer;
use crate::household::deployment::BuildInfo;
use crate::household::notifier::Routing;
use crate::household::schedule::{NotificationRule, Schedule, Topic, household_rules, resolve_local};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Control keywords didn't compile to a pattern.
    InvalidPattern { pattern: String, source: regex::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidPattern { pattern, source } => {
                write!(f, "invalid control pattern '{}': {}", pattern, source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidPattern { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// May be left empty when TELEGRAM_BOT_TOKEN is set
    #[serde(default)]
    telegram_bot_token: String,
    /// Developer chat: deployment announcements and test notifications
    dev_chat_id: i64,
    /// Household chat. If unset, whichever chat sent "bot ..." last gets the reminders.
    wg_chat_id: Option<i64>,
    /// Local testing: household reminders go to the dev chat.
    #[serde(default)]
    local: bool,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_control_prefix")]
    control_prefix: String,
    #[serde(default)]
    control_case_sensitive: bool,
    #[serde(default = "default_identify_keyword")]
    identify_keyword: String,
    signature: Option<String>,
    #[serde(default)]
    include_farewell: bool,
    #[serde(default = "default_send_timeout_secs")]
    send_timeout_secs: u64,
    meme_api_url: Option<String>,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    /// Replaces the built-in household table when present.
    rules: Option<Vec<RuleFile>>,
}

#[derive(Deserialize)]
struct RuleFile {
    topic: Topic,
    schedule: Schedule,
    body: Option<String>,
}

fn default_timezone() -> String {
    "Europe/Zurich".to_string()
}

fn default_control_prefix() -> String {
    "bot".to_string()
}

fn default_identify_keyword() -> String {
    "identify".to_string()
}

fn default_send_timeout_secs() -> u64 {
    10
}

const DEFAULT_BUILD_ID: &str = "local testing SHA";
const DEFAULT_BUILD_MESSAGE: &str = "local testing message";

pub struct Config {
    /// Path to the config file
    pub config_path: PathBuf,
    pub telegram_bot_token: String,
    pub dev_chat_id: i64,
    /// Effective household chat (the dev chat in local mode).
    pub wg_chat_id: Option<i64>,
    pub local: bool,
    pub timezone: Tz,
    pub control: ControlPattern,
    pub signature: Option<String>,
    pub include_farewell: bool,
    pub send_timeout: Duration,
    pub meme_api_url: Option<String>,
    pub log_chat_id: Option<ChatId>,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub rules: Vec<NotificationRule>,
    /// Build being run, from the deploy environment.
    pub build: BuildInfo,
}

impl Config {
    /// Load from `path`, applying overrides from the process environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load from `path` with `env` as the source of overrides.
    pub fn load_with_env<P, F>(path: P, env: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let mut file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if let Some(token) = env("TELEGRAM_BOT_TOKEN").filter(|t| !t.is_empty()) {
            file.telegram_bot_token = token;
        }
        let build = BuildInfo {
            id: env("GITHUB_COMMIT_SHA").unwrap_or_else(|| DEFAULT_BUILD_ID.to_string()),
            description: Some(
                env("GITHUB_COMMIT_MESSAGE").unwrap_or_else(|| DEFAULT_BUILD_MESSAGE.to_string()),
            ),
        };

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let timezone: Tz = file.timezone.parse().map_err(|e| {
            ConfigError::Validation(format!("unknown timezone '{}': {}", file.timezone, e))
        })?;

        if !file.control_prefix.chars().last().is_some_and(char::is_alphanumeric) {
            return Err(ConfigError::Validation(
                "control_prefix must be non-empty and end with a letter or digit".into(),
            ));
        }
        let control = ControlPattern::new(
            &file.control_prefix,
            &file.identify_keyword,
            file.control_case_sensitive,
        )
        .map_err(|e| ConfigError::InvalidPattern { pattern: file.control_prefix.clone(), source: e })?;

        if file.send_timeout_secs == 0 {
            return Err(ConfigError::Validation("send_timeout_secs must be positive".into()));
        }

        let rules = match file.rules {
            Some(rules) => rules
                .into_iter()
                .map(|r| {
                    let rule = NotificationRule::new(r.topic, r.schedule);
                    match r.body {
                        Some(body) => rule.with_body(body),
                        None => rule,
                    }
                })
                .collect(),
            None => household_rules(),
        };
        validate_rules(&rules, &timezone)?;

        let wg_chat_id = if file.local { Some(file.dev_chat_id) } else { file.wg_chat_id };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path,
            telegram_bot_token: file.telegram_bot_token,
            dev_chat_id: file.dev_chat_id,
            wg_chat_id,
            local: file.local,
            timezone,
            control,
            signature: file.signature,
            include_farewell: file.include_farewell,
            send_timeout: Duration::from_secs(file.send_timeout_secs),
            meme_api_url: file.meme_api_url,
            log_chat_id: file.log_chat_id.map(ChatId),
            data_dir,
            rules,
            build,
        })
    }

    pub fn routing(&self) -> Routing {
        Routing { wg_chat_id: self.wg_chat_id, dev_chat_id: self.dev_chat_id }
    }

    pub fn composer(&self) -> Composer {
        Composer::new(self.signature.clone(), self.include_farewell)
    }
}

fn validate_rules(rules: &[NotificationRule], timezone: &Tz) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.topic) {
            return Err(ConfigError::Validation(format!("more than one rule for topic '{}'", rule.topic)));
        }
        match &rule.schedule {
            Schedule::WeekdaysAt { days, .. } if days.is_empty() => {
                return Err(ConfigError::Validation(format!("rule '{}' has no weekdays", rule.topic)));
            }
            Schedule::MonthlyOnDay { day, .. } if !(1..=31).contains(day) => {
                return Err(ConfigError::Validation(format!(
                    "rule '{}' has day {} outside 1..=31",
                    rule.topic, day
                )));
            }
            Schedule::RepeatingInterval { period, anchor } => {
                if period.num_seconds() <= 0 {
                    return Err(ConfigError::Validation(format!(
                        "rule '{}' needs a positive period",
                        rule.topic
                    )));
                }
                if resolve_local(timezone, anchor).is_none() {
                    return Err(ConfigError::Validation(format!(
                        "rule '{}' anchor {} does not exist in {}",
                        rule.topic, anchor, timezone
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
