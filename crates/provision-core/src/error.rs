use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("policy bundle not found: {0}")]
    PolicyNotFound(String),

    #[error("policy bundle '{bundle}' denied the request: {reason}")]
    PolicyDenied { bundle: String, reason: String },

    #[error("credential broker unavailable: {0}")]
    CredentialBrokerUnavailable(String),

    #[error("credential denied: {0}")]
    CredentialDenied(String),

    #[error("backend module '{module}' failed: {source}")]
    Backend {
        module: String,
        #[source]
        source: crate::adapter::BackendError,
    },

    #[error("no adapter registered for module '{0}'")]
    UnknownModule(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run conflict: {0}")]
    RunConflict(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("run store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

// ---------------------------------------------------------------------------
// ErrorKind: the classified, caller-safe view of a failure
// ---------------------------------------------------------------------------

/// Classified error kind recorded on failed runs and returned to callers.
///
/// Carries no backend or broker detail, only the class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PolicyNotFound,
    PolicyDenied,
    CredentialUnavailable,
    CredentialDenied,
    BackendTransient,
    BackendRejected,
    BackendFatal,
    Cancelled,
    AuditWriteFailure,
    Abandoned,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::PolicyNotFound => "policy_not_found",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::CredentialUnavailable => "credential_unavailable",
            ErrorKind::CredentialDenied => "credential_denied",
            ErrorKind::BackendTransient => "backend_transient",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::BackendFatal => "backend_fatal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AuditWriteFailure => "audit_write_failure",
            ErrorKind::Abandoned => "abandoned",
            ErrorKind::Internal => "internal",
        }
    }

    /// True when the caller can fix the failure by changing the request.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::PolicyNotFound
                | ErrorKind::PolicyDenied
                | ErrorKind::CredentialDenied
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        use crate::adapter::BackendError;
        match self {
            ProvisionError::Validation(_) => ErrorKind::Validation,
            ProvisionError::PolicyNotFound(_) => ErrorKind::PolicyNotFound,
            ProvisionError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            ProvisionError::CredentialBrokerUnavailable(_) => ErrorKind::CredentialUnavailable,
            ProvisionError::CredentialDenied(_) => ErrorKind::CredentialDenied,
            ProvisionError::Backend { source, .. } => match source {
                BackendError::Transient(_) => ErrorKind::BackendTransient,
                BackendError::Rejected(_) => ErrorKind::BackendRejected,
                BackendError::Fatal(_) => ErrorKind::BackendFatal,
            },
            ProvisionError::UnknownModule(_) => ErrorKind::BackendFatal,
            ProvisionError::Cancelled => ErrorKind::Cancelled,
            ProvisionError::AuditWriteFailure(_) => ErrorKind::AuditWriteFailure,
            ProvisionError::RunNotFound(_)
            | ProvisionError::RunConflict(_)
            | ProvisionError::InvalidTransition { .. }
            | ProvisionError::Store(_)
            | ProvisionError::Config(_)
            | ProvisionError::Io(_)
            | ProvisionError::Yaml(_)
            | ProvisionError::Json(_) => ErrorKind::Internal,
        }
    }
}
