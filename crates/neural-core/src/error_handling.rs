//! Error classification and retry logic for provider calls.
//!
//! Transient failures (rate limits, network trouble, overloaded or erroring
//! servers, timeouts) are retried with exponential backoff and jitter. Context
//! overflow is classified but never retried here; the tool loop recovers from
//! it by compacting instead.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Base delay for exponential backoff (in milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Maximum delay between retries (in milliseconds)
const MAX_RETRY_DELAY_MS: u64 = 10000;

/// Jitter factor (0.0 to 1.0) to randomize retry delays
const JITTER_FACTOR: f64 = 0.3;

/// Details logged when a provider call finally fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub provider: String,
    pub model: String,
    pub session_id: String,
    pub app_context: String,
    pub timestamp: u64,
    pub context_tokens: u32,
}

impl ErrorContext {
    pub fn new(
        operation: &str,
        provider: &str,
        model: &str,
        session_id: &str,
        app_context: &str,
        context_tokens: u32,
    ) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            operation: operation.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            session_id: session_id.to_string(),
            app_context: app_context.to_string(),
            timestamp,
            context_tokens,
        }
    }

    pub fn log_error(&self, error: &anyhow::Error) {
        error!(
            operation = %self.operation,
            provider = %self.provider,
            model = %self.model,
            session = %self.session_id,
            app = %self.app_context,
            context_tokens = self.context_tokens,
            timestamp = self.timestamp,
            "Provider call failed: {:#}",
            error
        );
    }
}

/// Classification of error types
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorType {
    /// Errors that should be retried
    Recoverable(RecoverableError),
    /// Errors that should not be retried
    NonRecoverable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoverableError {
    RateLimit,
    NetworkError,
    ServerError,
    ModelBusy,
    Timeout,
    /// Handled by compaction, not by backoff
    TokenLimit,
    /// Handled by compaction, not by backoff
    ContextLengthExceeded,
}

impl RecoverableError {
    /// Whether waiting and trying again can help.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            RecoverableError::TokenLimit | RecoverableError::ContextLengthExceeded
        )
    }
}

/// Classify an error to determine if it should be retried
pub fn classify_error(error: &anyhow::Error) -> ErrorType {
    let error_str = format!("{:#}", error).to_lowercase();

    if error_str.contains("rate limit") || error_str.contains("rate_limit") || error_str.contains("429") {
        return ErrorType::Recoverable(RecoverableError::RateLimit);
    }

    if error_str.contains("context length")
        || error_str.contains("context_length_exceeded")
        || error_str.contains("maximum context length")
        || error_str.contains("prompt is too long")
    {
        return ErrorType::Recoverable(RecoverableError::ContextLengthExceeded);
    }

    if error_str.contains("network")
        || error_str.contains("connection")
        || error_str.contains("dns")
        || error_str.contains("refused")
    {
        return ErrorType::Recoverable(RecoverableError::NetworkError);
    }

    if error_str.contains("500")
        || error_str.contains("502")
        || error_str.contains("503")
        || error_str.contains("504")
        || error_str.contains("server error")
        || error_str.contains("internal error")
    {
        return ErrorType::Recoverable(RecoverableError::ServerError);
    }

    if error_str.contains("busy")
        || error_str.contains("overloaded")
        || error_str.contains("capacity")
        || error_str.contains("unavailable")
    {
        return ErrorType::Recoverable(RecoverableError::ModelBusy);
    }

    if error_str.contains("timeout") || error_str.contains("timed out") {
        return ErrorType::Recoverable(RecoverableError::Timeout);
    }

    if error_str.contains("token") && (error_str.contains("limit") || error_str.contains("exceeded")) {
        return ErrorType::Recoverable(RecoverableError::TokenLimit);
    }

    ErrorType::NonRecoverable
}

/// Calculate retry delay with exponential backoff and jitter
pub fn calculate_retry_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let base_delay = BASE_RETRY_DELAY_MS * (2_u64.pow(attempt.saturating_sub(1).min(16)));
    let capped_delay = base_delay.min(MAX_RETRY_DELAY_MS);

    let mut rng = rand::thread_rng();
    let jitter = (capped_delay as f64 * JITTER_FACTOR * rng.gen::<f64>()) as u64;
    let final_delay = if rng.gen_bool(0.5) {
        capped_delay + jitter
    } else {
        capped_delay.saturating_sub(jitter)
    };

    Duration::from_millis(final_delay)
}

/// Run `operation`, retrying transient failures up to `max_attempts` times.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    mut operation: F,
    context: &ErrorContext,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Operation '{}' succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(error) => match classify_error(&error) {
                ErrorType::Recoverable(kind) if kind.is_transient() && attempt < max_attempts => {
                    let delay = calculate_retry_delay(attempt);
                    warn!(
                        "Recoverable error ({:?}) in '{}' (attempt {}/{}). Retrying in {:?}: {}",
                        kind, operation_name, attempt, max_attempts, delay, error
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(error.context("Cancelled during retry backoff")),
                    }
                }
                kind => {
                    error!(
                        "'{}' failed after {} attempt(s) ({:?}). Giving up.",
                        operation_name, attempt, kind
                    );
                    context.log_error(&error);
                    return Err(error);
                }
            },
        }
    }
}
