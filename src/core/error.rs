//! Error types and protocol mapping.
//!
//! Every component returns [`TesseraError`]. The reconcilers decide what to
//! do with an error from its category alone:
//!
//! | Category | Variants | Handling |
//! |---|---|---|
//! | transient | `Conflict`, `SecretUnavailable`, `Internal` | requeue with backoff |
//! | data integrity | `Ambiguous` | requeue with backoff, nothing mutated |
//! | permanent content | `Validation`, `InvalidRequest`, `ImmutableField` | wait for a new spec |
//! | lookup | `NotFound`, `AlreadyExists` | handled at the call site |

use thiserror::Error;

/// Common error conditions across the store, cache and protocol layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    /// Object does not exist in the store.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// Object already exists in the store.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Optimistic concurrency failure: the stored object moved.
    #[error("conflict on {kind} {key}: expected resource version {expected}, found {found}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
        found: u64,
    },

    /// A lookup that must match exactly one record matched zero or several.
    #[error("ambiguous {kind} lookup for {selector}: {count} matches")]
    Ambiguous {
        kind: &'static str,
        selector: String,
        count: usize,
    },

    /// Attempt to change a field that is fixed after creation.
    #[error("{kind} {key}: field {field} is immutable")]
    ImmutableField {
        kind: &'static str,
        key: String,
        field: &'static str,
    },

    /// Resource content failed to decode against its schema.
    #[error("resource {index} ({resource_type}){}: {message}", field_suffix(.field))]
    Validation {
        index: usize,
        resource_type: String,
        field: Option<String>,
        message: String,
    },

    /// Referenced secret material could not be fetched.
    #[error("secret {key} unavailable: {reason}")]
    SecretUnavailable { key: String, reason: String },

    /// Malformed request or declaration.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(field) => format!(" field {}", field),
        None => String::new(),
    }
}

impl TesseraError {
    /// Create a NotFound error.
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create an Ambiguous error.
    pub fn ambiguous(kind: &'static str, selector: impl ToString, count: usize) -> Self {
        Self::Ambiguous {
            kind,
            selector: selector.to_string(),
            count,
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error should be retried by requeueing the reconcile.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::Ambiguous { .. }
                | Self::SecretUnavailable { .. }
                | Self::Internal { .. }
        )
    }

    /// Check if this error is caused by the declared content and needs a new spec.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::InvalidRequest { .. } | Self::ImmutableField { .. }
        )
    }

    /// Check if this error is a NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type using TesseraError.
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Convert a TesseraError to a tonic Status.
pub fn to_status(error: &TesseraError) -> tonic::Status {
    match error {
        TesseraError::NotFound { .. } => tonic::Status::not_found(error.to_string()),
        TesseraError::AlreadyExists { .. } => tonic::Status::already_exists(error.to_string()),
        TesseraError::Conflict { .. } => tonic::Status::aborted(error.to_string()),
        TesseraError::Ambiguous { .. } => tonic::Status::failed_precondition(error.to_string()),
        TesseraError::ImmutableField { .. }
        | TesseraError::Validation { .. }
        | TesseraError::InvalidRequest { .. } => tonic::Status::invalid_argument(error.to_string()),
        TesseraError::SecretUnavailable { .. } => tonic::Status::unavailable(error.to_string()),
        TesseraError::Internal { .. } => tonic::Status::internal(error.to_string()),
    }
}
