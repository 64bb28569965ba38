use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, FixedOffset, Offset, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    pub reminders: ReminderConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Outbound Web API access and inbound webhook verification for Slack.
///
/// Both secrets are optional: without a bot token replies are only logged, and
/// without a signing secret webhook requests are accepted unsigned.
#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub bot_token: Option<SecretString>,
    pub signing_secret: Option<SecretString>,
    pub bot_user_id: Option<String>,
    pub api_base_url: String,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub time_buffer_secs: u64,
    pub bot_identity: String,
}

#[derive(Clone, Debug)]
pub struct ReminderConfig {
    pub lookahead_hours: u32,
    pub expiry_grace_hours: u32,
    /// Offset applied to extracted deadlines that carry no zone of their own.
    pub default_utc_offset_minutes: i32,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub check_chats_interval_secs: u64,
    pub check_deadlines_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub server_port: Option<u16>,
    pub scheduler_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://pledge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            slack: SlackConfig {
                bot_token: None,
                signing_secret: None,
                bot_user_id: None,
                api_base_url: "https://slack.com/api".to_string(),
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
                max_tokens: 2000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            policy: PolicyConfig { time_buffer_secs: 30, bot_identity: "pledgebot".to_string() },
            reminders: ReminderConfig {
                lookahead_hours: 1,
                expiry_grace_hours: 24,
                default_utc_offset_minutes: -480,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                check_chats_interval_secs: 15,
                check_deadlines_interval_secs: 300,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl PolicyConfig {
    pub fn time_buffer(&self) -> Duration {
        Duration::seconds(self.time_buffer_secs.min(86_400) as i64)
    }
}

impl ReminderConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::hours(i64::from(self.lookahead_hours))
    }

    pub fn expiry_grace(&self) -> Duration {
        Duration::hours(i64::from(self.expiry_grace_hours))
    }

    pub fn default_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.default_utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pledge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(slack) = patch.slack {
            if let Some(bot_token) = slack.bot_token {
                self.slack.bot_token = Some(secret_value(bot_token));
            }
            if let Some(signing_secret) = slack.signing_secret {
                self.slack.signing_secret = Some(secret_value(signing_secret));
            }
            if let Some(bot_user_id) = slack.bot_user_id {
                self.slack.bot_user_id = Some(bot_user_id);
            }
            if let Some(api_base_url) = slack.api_base_url {
                self.slack.api_base_url = api_base_url;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(time_buffer_secs) = policy.time_buffer_secs {
                self.policy.time_buffer_secs = time_buffer_secs;
            }
            if let Some(bot_identity) = policy.bot_identity {
                self.policy.bot_identity = bot_identity;
            }
        }

        if let Some(reminders) = patch.reminders {
            if let Some(lookahead_hours) = reminders.lookahead_hours {
                self.reminders.lookahead_hours = lookahead_hours;
            }
            if let Some(expiry_grace_hours) = reminders.expiry_grace_hours {
                self.reminders.expiry_grace_hours = expiry_grace_hours;
            }
            if let Some(offset) = reminders.default_utc_offset_minutes {
                self.reminders.default_utc_offset_minutes = offset;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(enabled) = scheduler.enabled {
                self.scheduler.enabled = enabled;
            }
            if let Some(secs) = scheduler.check_chats_interval_secs {
                self.scheduler.check_chats_interval_secs = secs;
            }
            if let Some(secs) = scheduler.check_deadlines_interval_secs {
                self.scheduler.check_deadlines_interval_secs = secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PLEDGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PLEDGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PLEDGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PLEDGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PLEDGE_SLACK_BOT_TOKEN") {
            self.slack.bot_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("PLEDGE_SLACK_SIGNING_SECRET") {
            self.slack.signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("PLEDGE_SLACK_BOT_USER_ID") {
            self.slack.bot_user_id = Some(value);
        }
        if let Some(value) = read_env("PLEDGE_SLACK_API_BASE_URL") {
            self.slack.api_base_url = value;
        }

        if let Some(value) = read_env("PLEDGE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("PLEDGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PLEDGE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PLEDGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PLEDGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PLEDGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("PLEDGE_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("PLEDGE_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("PLEDGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PLEDGE_SERVER_PORT") {
            self.server.port = parse_u16("PLEDGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PLEDGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("PLEDGE_POLICY_TIME_BUFFER_SECS") {
            self.policy.time_buffer_secs = parse_u64("PLEDGE_POLICY_TIME_BUFFER_SECS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_POLICY_BOT_IDENTITY") {
            self.policy.bot_identity = value;
        }

        if let Some(value) = read_env("PLEDGE_REMINDERS_LOOKAHEAD_HOURS") {
            self.reminders.lookahead_hours = parse_u32("PLEDGE_REMINDERS_LOOKAHEAD_HOURS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_REMINDERS_EXPIRY_GRACE_HOURS") {
            self.reminders.expiry_grace_hours =
                parse_u32("PLEDGE_REMINDERS_EXPIRY_GRACE_HOURS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_REMINDERS_DEFAULT_UTC_OFFSET_MINUTES") {
            self.reminders.default_utc_offset_minutes =
                parse_i32("PLEDGE_REMINDERS_DEFAULT_UTC_OFFSET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("PLEDGE_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_bool("PLEDGE_SCHEDULER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_SCHEDULER_CHECK_CHATS_INTERVAL_SECS") {
            self.scheduler.check_chats_interval_secs =
                parse_u64("PLEDGE_SCHEDULER_CHECK_CHATS_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("PLEDGE_SCHEDULER_CHECK_DEADLINES_INTERVAL_SECS") {
            self.scheduler.check_deadlines_interval_secs =
                parse_u64("PLEDGE_SCHEDULER_CHECK_DEADLINES_INTERVAL_SECS", &value)?;
        }

        let log_level = read_env("PLEDGE_LOGGING_LEVEL").or_else(|| read_env("PLEDGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PLEDGE_LOGGING_FORMAT").or_else(|| read_env("PLEDGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = Some(secret_value(bot_token));
        }
        if let Some(signing_secret) = overrides.slack_signing_secret {
            self.slack.signing_secret = Some(secret_value(signing_secret));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_slack(&self.slack)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_policy(&self.policy)?;
        validate_reminders(&self.reminders)?;
        validate_scheduler(&self.scheduler)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pledge.toml"), PathBuf::from("config/pledge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    if let Some(bot_token) = &slack.bot_token {
        let bot_token = bot_token.expose_secret();
        if !bot_token.starts_with("xoxb-") {
            let hint = if bot_token.starts_with("xapp-") {
                " (hint: you may have used the app-level token instead of the bot token)"
            } else {
                ""
            };
            return Err(ConfigError::Validation(format!(
                "slack.bot_token must start with `xoxb-`{hint}. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions"
            )));
        }
    }

    if let Some(signing_secret) = &slack.signing_secret {
        if signing_secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "slack.signing_secret must not be blank. Get it from https://api.slack.com/apps > Your App > Basic Information".to_string(),
            ));
        }
    }

    let base_url = slack.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "slack.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model is required".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    if policy.time_buffer_secs > 86_400 {
        return Err(ConfigError::Validation(
            "policy.time_buffer_secs must be in range 0..=86400".to_string(),
        ));
    }

    if policy.bot_identity.trim().is_empty() {
        return Err(ConfigError::Validation("policy.bot_identity must not be blank".to_string()));
    }

    Ok(())
}

fn validate_reminders(reminders: &ReminderConfig) -> Result<(), ConfigError> {
    if reminders.lookahead_hours == 0 || reminders.lookahead_hours > 168 {
        return Err(ConfigError::Validation(
            "reminders.lookahead_hours must be in range 1..=168".to_string(),
        ));
    }

    if !(-720..=840).contains(&reminders.default_utc_offset_minutes) {
        return Err(ConfigError::Validation(
            "reminders.default_utc_offset_minutes must be in range -720..=840".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.check_chats_interval_secs == 0 || scheduler.check_deadlines_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "scheduler intervals must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.trim().parse::<i32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    slack: Option<SlackPatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    policy: Option<PolicyPatch>,
    reminders: Option<ReminderPatch>,
    scheduler: Option<SchedulerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    bot_token: Option<String>,
    signing_secret: Option<String>,
    bot_user_id: Option<String>,
    api_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    time_buffer_secs: Option<u64>,
    bot_identity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReminderPatch {
    lookahead_hours: Option<u32>,
    expiry_grace_hours: Option<u32>,
    default_utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    enabled: Option<bool>,
    check_chats_interval_secs: Option<u64>,
    check_deadlines_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
