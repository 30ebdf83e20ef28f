//! Error types for unseal-bootstrap
//!
//! Errors carry the resource kind and fully-qualified resource name where one
//! is known, so a failed run says exactly which cloud object it stopped at.

use thiserror::Error;

use crate::pki::PkiError;
use crate::resource::ResourceKind;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential file could not be loaded or exchanged for a token
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Token endpoint failed transiently (throttled, unavailable, unreachable)
    #[error("token endpoint unavailable: {0}")]
    TokenUnavailable(String),

    /// Resource provider call failed
    #[error("provider error [{kind}] for {resource}: {message}")]
    Provider {
        /// Kind of resource being read or written
        kind: ResourceKind,
        /// Fully-qualified resource name
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether a later attempt may succeed
        retryable: bool,
    },

    /// Create raced another writer and the resource now exists
    #[error("{kind} {resource} already exists")]
    AlreadyExists {
        /// Kind of resource
        kind: ResourceKind,
        /// Fully-qualified resource name
        resource: String,
    },

    /// Policy write carried a stale etag
    #[error("policy write conflict on {resource}")]
    PolicyConflict {
        /// Resource whose policy changed underneath us
        resource: String,
    },

    /// External call exceeded its deadline
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Certificate or key generation failed
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credentials error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a retryable token endpoint error
    pub fn token_unavailable(msg: impl Into<String>) -> Self {
        Self::TokenUnavailable(msg.into())
    }

    /// Create a retryable provider error
    pub fn provider(
        kind: ResourceKind,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            kind,
            resource: resource.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (permission denied, bad request)
    pub fn provider_permanent(
        kind: ResourceKind,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            kind,
            resource: resource.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: ResourceKind, resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            resource: resource.into(),
        }
    }

    /// Create a policy conflict error
    pub fn policy_conflict(resource: impl Into<String>) -> Self {
        Self::PolicyConflict {
            resource: resource.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Timeouts and transient provider failures are retryable. Absence is not
    /// an error at all, and conflicts are handled by the policy binder's own
    /// re-read loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::TokenUnavailable(_) => true,
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
