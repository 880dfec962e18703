//! Error types for the job queue core.

use std::error::Error as StdError;
use std::fmt;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

/// Opaque error carried by job bodies and wrapped on terminal failure.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Terminal failure of a job: every attempt was used up, and this wraps the
/// error from the last one. Constructed exactly once per failed job and
/// delivered through the job's completion handle; callers never see the raw
/// underlying error.
#[derive(Debug)]
pub struct JobError {
    last_error: BoxError,
}

impl JobError {
    pub fn new(last_error: impl Into<BoxError>) -> Self {
        Self {
            last_error: last_error.into(),
        }
    }

    /// The error from the final attempt, for inspection.
    pub fn last_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.last_error
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job failed. Last error: {}", self.last_error)
    }
}

impl StdError for JobError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.last_error as &(dyn StdError + 'static))
    }
}

/// Errors from the persistence store or job payload serialization.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from queue-level operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job streaming may only be started once per queue")]
    AlreadyStreaming,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error surface of the HTTP transport, as consumed by the retry policy.
/// Carries the numeric status and the response headers (where a
/// `Retry-After` hint may live).
#[derive(Debug, Clone, Error)]
#[error("HTTP error {code}")]
pub struct HttpError {
    pub code: u16,
    pub response_headers: HeaderMap,
}

impl HttpError {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            response_headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.response_headers.append(name, value);
        self
    }
}

/// Failure reported by the message transport for one send attempt.
#[derive(Debug, Error)]
pub enum SendError {
    /// The server rejected the request outright.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The destination account no longer exists.
    #[error("recipient {recipient_id} is not registered")]
    UnregisteredUser {
        recipient_id: String,
        #[source]
        http: HttpError,
    },

    /// A multi-recipient send where some targets failed.
    #[error(transparent)]
    Proto(#[from] ProtoSendError),

    /// Connection-level failure before any response was received.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    pub fn is_unregistered(&self) -> bool {
        matches!(self, Self::UnregisteredUser { .. })
    }
}

/// Multi-recipient send-protocol failure carrying each failed recipient's
/// error.
#[derive(Debug, Error)]
#[error("message send failed for {} recipient(s)", errors.len())]
pub struct ProtoSendError {
    pub errors: Vec<RecipientError>,
}

/// One recipient's share of a failed multi-recipient send.
#[derive(Debug)]
pub struct RecipientError {
    pub recipient_id: String,
    pub error: SendError,
}
