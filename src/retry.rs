//! Support utilities for [`keen_retry`]'s retry API, plus the error
//! classifier that decides which LLM failures are worth retrying.
//!
//! Fatal errors (bad credentials, malformed requests) are surfaced
//! immediately; transient errors (rate limits, timeouts, 5xx) are retried
//! with exponential backoff. Errors we cannot classify are treated as
//! transient, because giving a flaky gateway another chance is cheaper than
//! failing a whole record.

use core::fmt;
use std::error;

use async_openai::error::{ApiError, OpenAIError};
use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::prelude::*;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_retry {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient { input, error };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal { input, error };
            }
        }
    };
}

// Export the macro within the crate as if it were a normal symbol.
pub(crate) use try_retry;

/// The failure classes we distinguish when calling an LLM endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing credentials.
    Authentication,
    /// Valid credentials, but not allowed to use this model or endpoint.
    PermissionDenied,
    /// The request (or the endpoint's reply to it) was malformed.
    InvalidRequest,
    /// Over the endpoint's rate limit.
    RateLimit,
    /// The call did not complete in time.
    Timeout,
    /// The endpoint reported a server-side failure.
    Service,
    /// Anything we could not classify.
    Other,
}

impl ErrorKind {
    /// Fatal errors are never retried; no amount of waiting fixes them.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication
                | ErrorKind::PermissionDenied
                | ErrorKind::InvalidRequest
        )
    }

    /// A stable class name, recorded in `_error` fields.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::PermissionDenied => "PermissionDeniedError",
            ErrorKind::InvalidRequest => "InvalidRequestError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Service => "ServiceError",
            ErrorKind::Other => "APIError",
        }
    }
}

/// An error from a single LLM call attempt, classified for retry purposes.
#[derive(Debug)]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A classified timeout, for calls cut short by our own deadline.
    pub fn timeout(secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("LLM request exceeded {secs}s timeout"),
        )
    }

    /// Classify an [`OpenAIError`] from the chat endpoint.
    pub fn from_openai(err: OpenAIError) -> Self {
        let kind = match &err {
            OpenAIError::ApiError(api) => classify_api_error(api),
            OpenAIError::Reqwest(err) => classify_reqwest(err),
            OpenAIError::InvalidArgument(_) => ErrorKind::InvalidRequest,
            // A body we failed to deserialize usually means a gateway
            // returned a partial or non-JSON reply.
            OpenAIError::JSONDeserialize(_) => ErrorKind::Service,
            _ => ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl error::Error for CallError {}

/// Classify a structured API error by its reported type.
fn classify_api_error(api: &ApiError) -> ErrorKind {
    let error_type = api.r#type.as_deref().unwrap_or_default();
    if error_type.contains("authentication") || api.message.contains("API key") {
        ErrorKind::Authentication
    } else if error_type.contains("permission") {
        ErrorKind::PermissionDenied
    } else if error_type.contains("invalid_request") {
        ErrorKind::InvalidRequest
    } else if error_type.contains("rate_limit") {
        ErrorKind::RateLimit
    } else if error_type.contains("timeout") {
        ErrorKind::Timeout
    } else if error_type.contains("server_error") || error_type.contains("overloaded") {
        ErrorKind::Service
    } else {
        ErrorKind::Other
    }
}

/// Classify an HTTP-level error by status code. Errors with no status at
/// all (connection resets, DNS flakes) are assumed transient; `reqwest`
/// doesn't expose enough detail to be certain which are not.
fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if let Some(status) = err.status() {
        match status {
            StatusCode::UNAUTHORIZED => ErrorKind::Authentication,
            StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
            StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::InvalidRequest,
            StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimit,
            StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
            status if status.is_server_error() => ErrorKind::Service,
            _ => ErrorKind::Other,
        }
    } else if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Other
    }
}

/// Build a [`RetryResult::Ok`] value.
pub(crate) fn retry_ok<T>(output: T) -> RetryResult<(), (), T, CallError> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Fatal`] value.
pub(crate) fn retry_fatal<T>(
    kind: ErrorKind,
    message: impl Into<String>,
) -> RetryResult<(), (), T, CallError> {
    RetryResult::Fatal {
        input: (),
        error: CallError::new(kind, message),
    }
}

/// Convert a [`Result`] into a [`RetryResult`].
pub(crate) trait IntoRetryResult<T> {
    /// Route the error by its classified kind: fatal kinds become
    /// [`RetryResult::Fatal`], everything else [`RetryResult::Transient`].
    fn into_classified(self) -> RetryResult<(), (), T, CallError>;

    /// Treat any error as fatal.
    fn into_fatal(self) -> RetryResult<(), (), T, CallError>;
}

impl<T> IntoRetryResult<T> for Result<T, CallError> {
    fn into_classified(self) -> RetryResult<(), (), T, CallError> {
        match self {
            Ok(value) => retry_ok(value),
            Err(error) if error.kind.is_fatal() => {
                RetryResult::Fatal { input: (), error }
            }
            Err(error) => {
                debug!("Potentially transient error: {}", error);
                RetryResult::Transient { input: (), error }
            }
        }
    }

    fn into_fatal(self) -> RetryResult<(), (), T, CallError> {
        match self {
            Ok(value) => retry_ok(value),
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }
}
