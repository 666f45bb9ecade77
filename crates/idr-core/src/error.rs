use std::fmt;

use crate::record::RecordId;

/// Rejection of an inbound signature. The message is safe to show callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoContactMethod,
    MalformedEmail,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NoContactMethod => {
                write!(f, "At least one of email or phoneNumber must be provided")
            }
            ValidationError::MalformedEmail => write!(f, "Invalid email format"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// A broken structural guarantee of the record set. Always a bug, never a client error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    EmptyCluster { primary_id: RecordId },
    NotPrimary { id: RecordId },
    MultiplePrimaries { ids: Vec<RecordId> },
    DanglingLink { id: RecordId, linked_id: Option<RecordId>, expected: RecordId },
    NoCandidateToPromote,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::EmptyCluster { primary_id } => {
                write!(f, "cluster for primary {primary_id} has no live records")
            }
            InvariantViolation::NotPrimary { id } => {
                write!(f, "record {id} was expected to be primary")
            }
            InvariantViolation::MultiplePrimaries { ids } => {
                write!(f, "cluster has more than one primary: {ids:?}")
            }
            InvariantViolation::DanglingLink {
                id,
                linked_id,
                expected,
            } => write!(
                f,
                "record {id} links to {linked_id:?}, expected primary {expected}"
            ),
            InvariantViolation::NoCandidateToPromote => {
                write!(f, "no candidate available to promote to primary")
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Failure of a reconciliation. `E` is the store's own error type.
#[derive(Debug)]
pub enum ReconcileError<E> {
    Rejected(ValidationError),
    Store(E),
    Invariant(InvariantViolation),
}

impl<E: fmt::Display> fmt::Display for ReconcileError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Rejected(e) => write!(f, "rejected: {e}"),
            ReconcileError::Store(e) => write!(f, "store error: {e}"),
            ReconcileError::Invariant(v) => write!(f, "invariant violation: {v}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ReconcileError<E> {}

impl<E> From<InvariantViolation> for ReconcileError<E> {
    fn from(v: InvariantViolation) -> Self {
        ReconcileError::Invariant(v)
    }
}

impl<E> From<ValidationError> for ReconcileError<E> {
    fn from(e: ValidationError) -> Self {
        ReconcileError::Rejected(e)
    }
}

impl<E> ReconcileError<E> {
    /// Only rejections are the caller's fault; everything else is ours.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ReconcileError::Rejected(_))
    }
}
