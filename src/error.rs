// src/error.rs
//! Error taxonomy for generation jobs.
//!
//! Collaborators (submitter/poller) fail with [`ServiceError`]; the tracker
//! wraps those into [`TrackerError`] depending on where in the lifecycle the
//! failure happened.

use serde::Serialize;
use thiserror::Error;

/// Message fragment the upstream service returns when the selected API key
/// cannot see the requested model/operation. Informal, but it is the only
/// signal the service gives that the key has to be re-selected.
pub const CREDENTIAL_NOT_FOUND_SIGNATURE: &str = "Requested entity was not found";

/// Classification attached to a [`ServiceError`] when one can be derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    /// Key is selected but the backend does not recognise it for this resource
    CredentialInvalid,
    /// Missing key, or the backend rejected the key outright
    Unauthenticated,
    QuotaExceeded,
    InvalidRequest,
    /// Backend reported itself unavailable (5xx)
    Unavailable,
    /// The request never produced an HTTP response
    Transport,
}

impl ErrorTag {
    /// Map a Google RPC status string (`error.status` in API bodies)
    pub fn from_rpc_status(status: &str) -> Option<Self> {
        match status {
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => Some(Self::Unauthenticated),
            "RESOURCE_EXHAUSTED" => Some(Self::QuotaExceeded),
            "INVALID_ARGUMENT" | "FAILED_PRECONDITION" | "OUT_OF_RANGE" => {
                Some(Self::InvalidRequest)
            }
            "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => Some(Self::Unavailable),
            _ => None,
        }
    }

    /// Fallback classification when the body carried no RPC status
    pub fn from_http_status(code: u16) -> Option<Self> {
        match code {
            401 | 403 => Some(Self::Unauthenticated),
            429 => Some(Self::QuotaExceeded),
            400 | 413 | 422 => Some(Self::InvalidRequest),
            500..=599 => Some(Self::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialInvalid => write!(f, "credential_invalid"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// Failure reported by a job submitter or poller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub tag: Option<ErrorTag>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: ErrorTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Build an error from an API failure, keeping the upstream message verbatim.
    ///
    /// The not-found signature wins over any structured status since it is
    /// the one case where the caller has to re-select a key.
    pub fn from_api(http_status: u16, rpc_status: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let tag = if message.contains(CREDENTIAL_NOT_FOUND_SIGNATURE) {
            Some(ErrorTag::CredentialInvalid)
        } else {
            rpc_status
                .and_then(ErrorTag::from_rpc_status)
                .or_else(|| ErrorTag::from_http_status(http_status))
        };
        Self { message, tag }
    }

    /// Whether this failure means the selected credential must be re-selected.
    ///
    /// Substring sniffing on the message is kept alongside the tag because
    /// collaborators other than the Gemini client may not tag their errors.
    pub fn is_credential_invalid(&self) -> bool {
        matches!(
            self.tag,
            Some(ErrorTag::CredentialInvalid) | Some(ErrorTag::Unauthenticated)
        ) || self.message.contains(CREDENTIAL_NOT_FOUND_SIGNATURE)
    }
}

/// Coarse kind of a tracker failure, for callers that pick a message per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Submission,
    Poll,
    ProtocolViolation,
}

/// Terminal failure of a tracked job
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The initial job request was rejected
    #[error("Failed to start video generation: {0}")]
    Submission(ServiceError),
    /// A status check could not be completed
    #[error("Error checking video status: {0}")]
    Poll(ServiceError),
    /// The service reported completion without a result reference
    #[error("Video generation finished but no video URI was found.")]
    ProtocolViolation,
}

impl TrackerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Submission(_) => FailureKind::Submission,
            Self::Poll(_) => FailureKind::Poll,
            Self::ProtocolViolation => FailureKind::ProtocolViolation,
        }
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Submission(e) | Self::Poll(e) => Some(e),
            Self::ProtocolViolation => None,
        }
    }

    pub fn tag(&self) -> Option<ErrorTag> {
        self.service_error().and_then(|e| e.tag)
    }

    pub fn is_credential_invalid(&self) -> bool {
        self.service_error()
            .map(ServiceError::is_credential_invalid)
            .unwrap_or(false)
    }
}

/// Serializable view of a [`TrackerError`] for API responses
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: FailureKind,
    pub tag: Option<ErrorTag>,
    pub message: String,
    pub credential_invalid: bool,
}

impl From<&TrackerError> for ErrorReport {
    fn from(err: &TrackerError) -> Self {
        Self {
            kind: err.kind(),
            tag: err.tag(),
            message: err.to_string(),
            credential_invalid: err.is_credential_invalid(),
        }
    }
}

/// Caller-side validation failure for a job request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Please enter a prompt.")]
    EmptyPrompt,
}
