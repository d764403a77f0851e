use crate::error::{ConfigError, Result as AppResult};
use crate::twitch::backoff::RetryPolicy;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config";
const ENV_PREFIX: &str = "MULTICHAT";

/// Flat variables kept from the older `.env` layout, mapped onto settings keys.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("TWITCH_IRC_TOKEN", "twitch.token"),
    ("TWITCH_BOT_USERNAME", "twitch.nick"),
    ("TWITCH_STREAMER_LOGIN", "twitch.channel"),
    ("TWITCH_CLIENT_ID", "twitch.client_id"),
    ("TWITCH_CLIENT_SECRET", "twitch.client_secret"),
    ("TWITCH_REFRESH_TOKEN", "twitch.refresh_token"),
    ("TWITCH_TOKEN_EXPIRES_AT", "twitch.token_expires_at"),
    ("TWITCH_RETRY_BASE", "twitch.retry_base_secs"),
    ("TWITCH_RETRY_MAX", "twitch.retry_max_secs"),
    ("TWITCH_RETRY_MAX_ATTEMPTS", "twitch.retry_max_attempts"),
    ("TWITCH_RESTART_ON_REFRESH", "twitch.restart_on_refresh"),
    ("TWITCH_ECHO_MESSAGES", "twitch.echo_messages"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub channel: Option<String>,
    pub nick: String,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    /// Zero or negative means retry forever.
    pub retry_max_attempts: Option<i64>,
    pub restart_on_refresh: bool,
    pub echo_messages: bool,
    pub request_tags: bool,
    pub reply_to_ping_command: bool,
    pub resolve_bot_id: bool,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            channel: None,
            nick: "twitch-bot".to_string(),
            token: None,
            client_id: None,
            client_secret: None,
            refresh_token: None,
            token_expires_at: None,
            retry_base_secs: 5,
            retry_max_secs: 300,
            retry_max_attempts: None,
            restart_on_refresh: false,
            echo_messages: true,
            request_tags: false,
            reply_to_ping_command: true,
            resolve_bot_id: false,
        }
    }
}

impl TwitchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_secs),
            max: Duration::from_secs(self.retry_max_secs),
            max_attempts: self
                .retry_max_attempts
                .filter(|max| *max > 0)
                .map(|max| u32::try_from(max).unwrap_or(u32::MAX)),
        }
    }

    /// Client id and secret, when both are configured and non-empty.
    pub fn app_credentials(&self) -> Option<(&str, &str)> {
        let id = self.client_id.as_deref().filter(|s| !s.is_empty())?;
        let secret = self.client_secret.as_deref().filter(|s| !s.is_empty())?;
        Some((id, secret))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_base_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "twitch.retry_base_secs must be greater than zero".to_string(),
            ));
        }
        if self.retry_max_secs < self.retry_base_secs {
            return Err(ConfigError::InvalidValue(format!(
                "twitch.retry_max_secs ({}) must not be below twitch.retry_base_secs ({})",
                self.retry_max_secs, self.retry_base_secs
            )));
        }
        if self.nick.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "twitch.nick must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub directory: PathBuf,
    pub file_name: String,
    pub max_file_bytes: u64,
    pub max_backups: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
            file_name: "multichat.log".to_string(),
            max_file_bytes: 5 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

impl LoggingConfig {
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

pub fn load_settings(config_path: Option<&Path>) -> AppResult<AppSettings> {
    load_settings_from(config_path, None, |key| std::env::var(key).ok())
}

/// `env` replaces the process environment for the `MULTICHAT__*` layer when
/// given; `legacy` resolves the flat `TWITCH_*` variables.
fn load_settings_from(
    config_path: Option<&Path>,
    env: Option<config::Map<String, String>>,
    legacy: impl Fn(&str) -> Option<String>,
) -> AppResult<AppSettings> {
    let file = match config_path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let mut builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    for (env_key, settings_key) in LEGACY_ENV_KEYS {
        let Some(value) = legacy(env_key) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        builder = builder
            .set_override(*settings_key, value.to_string())
            .map_err(|e| ConfigError::Load(e.to_string()))?;
    }

    let settings: AppSettings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.twitch.validate()?;
    Ok(settings)
}
