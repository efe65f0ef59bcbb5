//! Error types for the edge hub core
//!
//! Every error carries a kind from the hub's failure taxonomy. Retry decisions
//! are made from that kind (see [`crate::cloud::retry`]), never by matching on
//! individual call sites.

use crate::identity::Identity;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy shared by all components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, throttling, link down. Retried per component policy.
    Transient,
    /// Malformed route, unsupported operation. Surfaced immediately.
    Configuration,
    /// Authentication or credential failure. Needs re-provisioning.
    Fatal,
    /// Queue full. Counted, not raised.
    Capacity,
}

/// Protocol-neutral error condition handed to transport adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    NotAllowed,
    ArgumentError,
    Unauthorized,
    NotFound,
    ResourceLimitExceeded,
    PreconditionFailed,
    MessageSizeExceeded,
    Throttled,
    InternalError,
}

/// Error condition plus a sanitised description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub condition: ErrorCondition,
    pub description: String,
}

/// Main error type for hub operations
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Upstream link is down: {message}")]
    LinkDown { message: String },

    #[error("Request throttled by upstream")]
    Throttled,

    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed for {identity}: {message}")]
    Unauthorized { identity: String, message: String },

    #[error("Operation '{operation}' is not supported for {identity}")]
    UnsupportedOperation { identity: String, operation: String },

    #[error("Could not replace existing connection for {0}")]
    IdentityConflict(Identity),

    #[error("Twin version conflict: {message}")]
    VersionConflict { message: String },

    #[error("Queue full for {queue}: {depth} messages")]
    QueueFull { queue: String, depth: usize },

    #[error("Invalid route '{route}': {message}")]
    InvalidRoute { route: String, message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection closed for {0}")]
    ConnectionClosed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl HubError {
    /// Classify the error into the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::LinkDown { .. }
            | HubError::Throttled
            | HubError::Timeout(_)
            | HubError::IdentityConflict(_)
            | HubError::VersionConflict { .. }
            | HubError::ConnectionClosed(_)
            | HubError::Cancelled
            | HubError::InternalError { .. } => ErrorKind::Transient,
            HubError::MessageTooLarge { .. }
            | HubError::UnsupportedOperation { .. }
            | HubError::InvalidRoute { .. }
            | HubError::InvalidArgument { .. }
            | HubError::UnknownEndpoint(_)
            | HubError::NotFound(_)
            | HubError::ConfigError(_)
            | HubError::Serialization(_) => ErrorKind::Configuration,
            HubError::Unauthorized { .. } => ErrorKind::Fatal,
            HubError::QueueFull { .. } => ErrorKind::Capacity,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Map to a protocol-neutral condition with a sanitised description
    pub fn to_error_condition(&self) -> ErrorReport {
        let condition = match self {
            HubError::UnsupportedOperation { .. } | HubError::ConnectionClosed(_) => {
                ErrorCondition::NotAllowed
            }
            HubError::InvalidRoute { .. }
            | HubError::InvalidArgument { .. }
            | HubError::ConfigError(_)
            | HubError::Serialization(_) => ErrorCondition::ArgumentError,
            HubError::Unauthorized { .. } => ErrorCondition::Unauthorized,
            HubError::NotFound(_) | HubError::UnknownEndpoint(_) => ErrorCondition::NotFound,
            HubError::QueueFull { .. } => ErrorCondition::ResourceLimitExceeded,
            HubError::VersionConflict { .. } | HubError::IdentityConflict(_) => {
                ErrorCondition::PreconditionFailed
            }
            HubError::MessageTooLarge { .. } => ErrorCondition::MessageSizeExceeded,
            HubError::Throttled => ErrorCondition::Throttled,
            HubError::LinkDown { .. }
            | HubError::Timeout(_)
            | HubError::Cancelled
            | HubError::InternalError { .. } => ErrorCondition::InternalError,
        };

        ErrorReport {
            condition,
            description: sanitize_error_message(&self.to_string()),
        }
    }

    pub fn link_down<S: Into<String>>(message: S) -> Self {
        Self::LinkDown {
            message: message.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(identity: &Identity, message: S) -> Self {
        Self::Unauthorized {
            identity: identity.to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(identity: &Identity, operation: S) -> Self {
        Self::UnsupportedOperation {
            identity: identity.to_string(),
            operation: operation.into(),
        }
    }

    pub fn version_conflict<S: Into<String>>(message: S) -> Self {
        Self::VersionConflict {
            message: message.into(),
        }
    }

    pub fn invalid_route<R: Into<String>, S: Into<String>>(route: R, message: S) -> Self {
        Self::InvalidRoute {
            route: route.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|sig|sharedaccesskey)[=:]\s*[^\s&;]+")
        .expect("secret pattern is valid")
});

static SIGNATURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SharedAccessSignature\s+\S+").expect("signature pattern is valid")
});

/// Redact credentials and cap length before an error leaves the hub
fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SIGNATURE_PATTERN
        .replace_all(message, "SharedAccessSignature ***")
        .to_string();
    sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;
