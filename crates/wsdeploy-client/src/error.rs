//! Error types for wsdeploy-client

use thiserror::Error;

use crate::token::TokenError;

/// Classified failure of one logical invocation
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The API kept answering 429 after every allowed retry
    #[error("{method} {url} still throttled after {attempts} attempts")]
    Throttled {
        method: String,
        url: String,
        attempts: u32,
    },

    /// 5xx responses or transport failures exhausted the retry budget
    #[error("{method} {url} failed after {attempts} attempts: {detail}")]
    TransientServer {
        method: String,
        url: String,
        attempts: u32,
        detail: String,
    },

    /// 401/403 persisted after a forced token refresh
    #[error("{method} {url} rejected credentials with status {status}")]
    Auth {
        method: String,
        url: String,
        status: u16,
    },

    /// No token could be obtained from the credential source
    #[error("token acquisition failed: {0}")]
    Token(#[from] TokenError),

    /// Non-retryable 4xx response
    #[error("{method} {url} returned {status}: {body}")]
    TerminalClient {
        method: String,
        url: String,
        status: u16,
        /// Value of the `x-ms-public-api-error-code` header when present
        api_error_code: Option<String>,
        body: String,
    },

    /// Status outside the 2xx/4xx/5xx ranges the invoker understands
    #[error("{method} {url} returned unexpected status {status}")]
    UnexpectedStatus {
        method: String,
        url: String,
        status: u16,
    },

    /// Long-running operation reached the `Failed` state
    #[error("long-running operation failed ({code}): {message}")]
    OperationFailed { code: String, message: String },

    /// Long-running operation reported `Undefined`
    #[error("long-running operation is in an undefined state: {body}")]
    OperationUndefined { body: String },

    /// Long-running operation did not finish within the poll budget
    #[error("long-running operation did not finish after {polls} polls")]
    OperationTimedOut { polls: u32 },

    /// 202 Accepted without a Location header to poll
    #[error("202 response from {url} has no Location header")]
    MissingLocation { url: String },

    /// Response body did not carry what the caller needed
    #[error("unexpected response body from {url}: {detail}")]
    UnexpectedBody { url: String, detail: String },

    /// Request could not be built or sent at all
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Retry policy values are unusable
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    /// JSON response body failed to parse
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl InvokeError {
    /// Whether the failure was transient in nature (throttling, 5xx, transport).
    ///
    /// By the time one of these surfaces the invoker has already spent its
    /// retry budget; callers use this to classify, not to retry again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvokeError::Throttled { .. } | InvokeError::TransientServer { .. }
        )
    }

    /// Whether the failure came from authentication
    pub fn is_auth(&self) -> bool {
        matches!(self, InvokeError::Auth { .. } | InvokeError::Token(_))
    }

    /// HTTP status attached to the failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            InvokeError::Auth { status, .. }
            | InvokeError::TerminalClient { status, .. }
            | InvokeError::UnexpectedStatus { status, .. } => Some(*status),
            InvokeError::Throttled { .. } => Some(429),
            _ => None,
        }
    }
}
