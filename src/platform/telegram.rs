//! Telegram Bot API binding.
//!
//! Uses `deleteMessage` and `deleteMessages` (up to 100 ids per call).
//! Every response is classified into a [`PlatformError`] by
//! [`classify_response`], which is pure so it can be tested without HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatPlatform, PlatformError, is_temporary_error, parse_retry_after};
use crate::{config::TelegramConfig, observability::metrics};

pub struct TelegramPlatform {
    client: Client,
    /// `{api_base_url}/bot{token}`, without a trailing slash.
    endpoint: String,
}

impl TelegramPlatform {
    pub fn from_config(config: &TelegramConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(
            client,
            &config.api_base_url,
            &config.bot_token,
        ))
    }

    pub fn with_client(client: Client, api_base_url: &str, bot_token: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/bot{}", api_base_url.trim_end_matches('/'), bot_token),
        }
    }

    async fn call<B: Serialize + ?Sized>(&self, method: &str, body: &B) -> Result<(), PlatformError> {
        let url = format!("{}/{}", self.endpoint, method);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            // The URL carries the token, so only the error kind is kept
            .map_err(|e| PlatformError::transient(describe_transport_error(&e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::transient(describe_transport_error(&e)))?;

        classify_response(status, &text)
    }
}

#[derive(Serialize)]
struct DeleteMessageRequest {
    chat_id: i64,
    message_id: i64,
}

#[derive(Serialize)]
struct DeleteMessagesRequest<'a> {
    chat_id: i64,
    message_ids: &'a [i64],
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), PlatformError> {
        let result = self
            .call(
                "deleteMessage",
                &DeleteMessageRequest {
                    chat_id,
                    message_id,
                },
            )
            .await;
        metrics::record_platform_call("single", result.is_ok());
        result
    }

    async fn delete_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<(), PlatformError> {
        let result = self
            .call(
                "deleteMessages",
                &DeleteMessagesRequest {
                    chat_id,
                    message_ids,
                },
            )
            .await;
        metrics::record_platform_call("batch", result.is_ok());
        result
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

/// Map an HTTP status and Bot API body to an outcome.
pub fn classify_response(status: u16, body: &str) -> Result<(), PlatformError> {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();

    let Some(response) = parsed else {
        return match status {
            200..=299 => Err(PlatformError::transient(format!(
                "HTTP {status}: unreadable response body"
            ))),
            401 | 403 => Err(PlatformError::Forbidden(format!("HTTP {status}"))),
            404 => Err(PlatformError::Unsupported),
            429 => Err(PlatformError::RateLimited {
                retry_after: Duration::ZERO,
            }),
            400..=499 => Err(PlatformError::BadRequest(format!("HTTP {status}"))),
            _ => Err(PlatformError::transient(format!("HTTP {status}"))),
        };
    };

    if response.ok {
        return Ok(());
    }

    let code = response.error_code.unwrap_or(status);
    let description = response
        .description
        .unwrap_or_else(|| format!("HTTP {code}"));
    let advertised = response
        .parameters
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);

    match code {
        401 | 403 => Err(PlatformError::Forbidden(description)),
        429 => Err(PlatformError::RateLimited {
            retry_after: advertised
                .or_else(|| parse_retry_after(&description))
                .unwrap_or(Duration::ZERO),
        }),
        _ if advertised.is_some() => Err(PlatformError::RateLimited {
            retry_after: advertised.unwrap_or_default(),
        }),
        404 => Err(PlatformError::Unsupported),
        500..=599 => Err(PlatformError::transient(description)),
        _ if is_temporary_error(&description) => Err(PlatformError::transient(description)),
        _ => Err(PlatformError::BadRequest(description)),
    }
}

fn describe_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else if error.is_body() || error.is_decode() {
        "failed to read response body".to_string()
    } else {
        "request failed".to_string()
    }
}
