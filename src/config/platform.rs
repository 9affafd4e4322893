use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Chat platform binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformConfig {
    Telegram(TelegramConfig),
}

impl PlatformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            PlatformConfig::Telegram(cfg) => cfg.validate(),
        }
    }
}

/// Telegram Bot API settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather. Usually `${TELEGRAM_BOT_TOKEN}`.
    pub bot_token: String,

    /// Bot API root, without the `/bot<token>` suffix.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Timeout for a single API call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl TelegramConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::Validation(
                "platform.bot_token cannot be empty".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "platform.request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Keeps the token out of logs.
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"****")
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}
