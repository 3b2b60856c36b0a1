//! Retry Policy
//!
//! Exponential backoff with jitter for reopening streams and repeating
//! unary calls, plus helpers for the typed details that storage attaches
//! to gRPC statuses (redirects and per-range failures).

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::application::error::StorageError;
use crate::infrastructure::grpc::proto::{
    self, BidiReadObjectError, BidiReadObjectRedirectedError, BidiWriteObjectRedirectedError,
};
use crate::infrastructure::metrics::{self, Operation};

// =============================================================================
// Backoff
// =============================================================================

/// Configuration for retry backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum number of retries (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Exponential backoff state.
///
/// # Example
///
/// ```rust
/// use object_stream::infrastructure::retry::{Backoff, BackoffConfig};
///
/// let mut backoff = Backoff::new(BackoffConfig::default());
/// assert!(backoff.next_delay().is_some());
///
/// // Progress was made; start over from the initial delay.
/// backoff.reset();
/// assert_eq!(backoff.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl Backoff {
    /// Create a backoff at its initial delay.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Next delay with jitter applied, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Wait for the next delay unless cancelled first.
    ///
    /// # Errors
    ///
    /// [`BackoffError::Exhausted`] when no attempts remain,
    /// [`BackoffError::Cancelled`] when `cancel` fires during the wait.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Duration, BackoffError> {
        let delay = self.next_delay().ok_or(BackoffError::Exhausted {
            attempts: self.attempt_count,
        })?;
        tokio::select! {
            () = cancel.cancelled() => Err(BackoffError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(delay),
        }
    }

    /// Start over after progress.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts taken since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Why a backoff wait ended without another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    /// Maximum attempts reached.
    #[error("maximum retry attempts ({attempts}) exceeded")]
    Exhausted {
        /// Attempts taken.
        attempts: u32,
    },
    /// Cancellation token fired.
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

// =============================================================================
// Retrier
// =============================================================================

/// Decides whether a failed attempt gets another try and waits before it.
#[derive(Debug, Clone)]
pub struct Retrier {
    backoff: Backoff,
    cancel: CancellationToken,
}

impl Retrier {
    /// Create a retrier.
    #[must_use]
    pub const fn new(config: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            backoff: Backoff::new(config),
            cancel,
        }
    }

    /// Pause before retrying after `err`.
    ///
    /// # Errors
    ///
    /// Returns `err` unchanged if it is not retryable,
    /// [`StorageError::RetriesExhausted`] once attempts run out, and
    /// [`StorageError::Cancelled`] if cancelled during the wait.
    pub async fn pause(
        &mut self,
        err: StorageError,
        operation: Operation,
    ) -> Result<(), StorageError> {
        if !err.is_retryable() {
            return Err(err);
        }
        self.wait_after(err, operation).await
    }

    /// Wait before another attempt after `err` whether or not it is
    /// retryable on its own. The attempt still counts toward the limit.
    ///
    /// # Errors
    ///
    /// [`StorageError::RetriesExhausted`] once attempts run out and
    /// [`StorageError::Cancelled`] if cancelled during the wait.
    pub async fn wait_after(
        &mut self,
        err: StorageError,
        operation: Operation,
    ) -> Result<(), StorageError> {
        match self.backoff.wait(&self.cancel).await {
            Ok(delay) => {
                metrics::record_retry(operation);
                tracing::warn!(
                    error = %err,
                    %operation,
                    attempt = self.backoff.attempt_count(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Transient failure, retrying"
                );
                Ok(())
            }
            Err(BackoffError::Exhausted { attempts }) => Err(StorageError::RetriesExhausted {
                attempts,
                last: Box::new(err),
            }),
            Err(BackoffError::Cancelled) => Err(StorageError::Cancelled),
        }
    }

    /// Run a unary call until it succeeds or fails permanently.
    ///
    /// # Errors
    ///
    /// The first non-retryable error, or the error from [`Self::pause`].
    pub async fn run<T, F, Fut>(
        &mut self,
        operation: Operation,
        mut call: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match call().await {
                Ok(value) => {
                    self.backoff.reset();
                    return Ok(value);
                }
                Err(err) => self.pause(err, operation).await?,
            }
        }
    }

    /// Start over after progress.
    pub const fn reset(&mut self) {
        self.backoff.reset();
    }

    /// Token that aborts waits.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

// =============================================================================
// Status Details
// =============================================================================

/// Whether a status code is transient on its own.
#[must_use]
pub const fn is_transient_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::ResourceExhausted | Code::Internal
    )
}

/// Whether `status` must be retried: a transient code, or `Aborted` with a
/// redirect attached.
#[must_use]
pub fn is_retryable_status(status: &Status) -> bool {
    if is_transient_code(status.code()) {
        return true;
    }
    status.code() == Code::Aborted
        && (read_redirect(status).is_some() || write_redirect(status).is_some())
}

/// Redirect detail on a read stream status.
#[must_use]
pub fn read_redirect(status: &Status) -> Option<BidiReadObjectRedirectedError> {
    find_detail(status, proto::READ_REDIRECT_TYPE_URL)
}

/// Redirect detail on a write stream status.
#[must_use]
pub fn write_redirect(status: &Status) -> Option<BidiWriteObjectRedirectedError> {
    find_detail(status, proto::WRITE_REDIRECT_TYPE_URL)
}

/// Per-range failure detail on a read stream status.
#[must_use]
pub fn read_object_error(status: &Status) -> Option<BidiReadObjectError> {
    find_detail(status, proto::READ_OBJECT_ERROR_TYPE_URL)
}

/// Build a status carrying one typed detail.
#[must_use]
pub fn status_with_detail<M: Message>(
    code: Code,
    message: impl Into<String>,
    type_url: &str,
    detail: &M,
) -> Status {
    let message = message.into();
    let rpc_status = proto::google::rpc::Status {
        code: code as i32,
        message: message.clone(),
        details: vec![prost_types::Any {
            type_url: type_url.to_string(),
            value: detail.encode_to_vec(),
        }],
    };
    Status::with_details(code, message, Bytes::from(rpc_status.encode_to_vec()))
}

fn find_detail<M: Message + Default>(status: &Status, type_url: &str) -> Option<M> {
    if status.details().is_empty() {
        return None;
    }
    let rpc_status = proto::google::rpc::Status::decode(status.details()).ok()?;
    rpc_status
        .details
        .iter()
        .find(|any| any.type_url == type_url)
        .and_then(|any| M::decode(any.value.as_slice()).ok())
}

// =============================================================================
// Tests
// =============================================================================
