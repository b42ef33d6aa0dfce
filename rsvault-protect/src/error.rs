//! Error taxonomy shared by the reader, poller, reconciler and verifier.
//!
//! Callers branch on semantics (not found, transient, rejected, ...) and never
//! on raw HTTP status codes.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::identity::{IdentityError, ProtectedItemIdentity};

/// Failure talking to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Resource not found")]
    NotFound,

    #[error("Throttled by control plane (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("Control plane server error: {status} {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request rejected: {status} {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Throttled { .. } | RemoteError::Server { .. } | RemoteError::Transport(_)
        )
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A point lookup failed for a reason other than "not found".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to query {item} in vault {vault}: {cause}")]
pub struct RemoteQueryError {
    pub vault: String,
    pub item: String,
    #[source]
    pub cause: RemoteError,
}

/// The reconciliation step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Delete,
    Import,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Delete => "delete",
            Operation::Import => "import",
        };
        f.write_str(name)
    }
}

/// Why a reconciliation step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileErrorKind {
    #[error(transparent)]
    Input(#[from] IdentityError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("remote operation failed: {code}: {message}")]
    OperationFailed { code: String, message: String },

    #[error("remote operation did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("binding still present after {attempts} verification attempts")]
    StillExists { attempts: u32 },

    #[error("binding not visible after {attempts} verification attempts")]
    NotFoundAfterCreate { attempts: u32 },

    #[error("binding does not exist")]
    NotFound,
}

/// A reconciliation failure with enough context to diagnose it without
/// querying the control plane again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} of protected VM {identity} failed: {kind}")]
pub struct ReconcileError {
    pub identity: String,
    pub operation: Operation,
    #[source]
    pub kind: ReconcileErrorKind,
}

impl ReconcileError {
    pub fn new(
        identity: &ProtectedItemIdentity,
        operation: Operation,
        kind: impl Into<ReconcileErrorKind>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            operation,
            kind: kind.into(),
        }
    }

    /// Input error raised before an identity could be built.
    pub fn input(source: &str, operation: Operation, err: IdentityError) -> Self {
        Self {
            identity: source.to_string(),
            operation,
            kind: ReconcileErrorKind::Input(err),
        }
    }

    /// Timeouts and transient remote failures may succeed on a later attempt;
    /// input errors and failed operations will not.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ReconcileErrorKind::TimedOut(_)
            | ReconcileErrorKind::StillExists { .. }
            | ReconcileErrorKind::NotFoundAfterCreate { .. } => true,
            ReconcileErrorKind::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Existence assertion failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("Protected VM {0} was not found")]
    NotFound(String),

    #[error("Protected VM {0} still exists")]
    StillExists(String),

    #[error(transparent)]
    Lookup(#[from] RemoteQueryError),
}
