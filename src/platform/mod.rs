//! Chat platform bindings.
//!
//! A binding turns the platform's own failure shapes into the closed
//! [`PlatformError`] set at the boundary, so the executor never inspects
//! raw transport errors or response bodies.

pub mod telegram;
#[cfg(test)]
pub(crate) mod testing;

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

pub use telegram::TelegramPlatform;

/// Classified failure of a delete call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The bot lacks rights in the chat, or was removed from it. Terminal.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The request was rejected as malformed or the message is not deletable.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The platform asked the caller to wait.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Network failure, timeout, or a server-side error worth retrying.
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The platform has no such operation (e.g. batch delete).
    #[error("Operation not supported by platform")]
    Unsupported,
}

impl PlatformError {
    pub fn transient(message: impl Into<String>) -> Self {
        let message = message.into();
        let retry_after = parse_retry_after(&message);
        PlatformError::Transient {
            message,
            retry_after,
        }
    }
}

/// Delete operations offered by a chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Delete a single message.
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), PlatformError>;

    /// Delete several messages of one chat in a single call.
    ///
    /// Platforms without a batch operation keep the default, which reports
    /// [`PlatformError::Unsupported`].
    async fn delete_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<(), PlatformError> {
        let _ = (chat_id, message_ids);
        Err(PlatformError::Unsupported)
    }

    /// Binding name for logs.
    fn name(&self) -> &'static str;
}

static RETRY_AFTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry\s*after\s*(\d+)").expect("retry-after pattern is valid")
});

const TEMPORARY_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily unavailable",
    "internal server error",
    "bad gateway",
    "retry after",
    "too many requests",
    "flood",
];

const ALREADY_GONE_MARKERS: &[&str] = &[
    "message to delete not found",
    "message can't be deleted",
    "message can not be deleted",
    "message identifier is not specified",
];

/// Extract a `retry after N` wait (seconds) from an error description.
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    RETRY_AFTER_PATTERN
        .captures(text)
        .and_then(|cap| cap[1].parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Whether an error description reads like a temporary condition.
pub fn is_temporary_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    TEMPORARY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Whether an error description says the message is gone or can never be deleted.
pub fn is_already_gone(text: &str) -> bool {
    let lower = text.to_lowercase();
    ALREADY_GONE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
