use serde::Serialize;
use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::collab::{PaymentError, Unauthenticated};

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// Unknown or expired reference.
    NotFound,
    /// Capacity, overlap or duplicate. The caller may retry with other parameters.
    Conflict,
    /// Cutoffs, quotas, account state.
    Policy,
    /// Lock wait, storage or payment trouble. Safe to retry.
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("member {0} is not active")]
    InactiveMember(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("booking window has closed")]
    TooLateToBook,
    #[error("member already holds reservation {0} for this class")]
    AlreadyReserved(Ulid),
    #[error("monthly quota of {quota} standard reservations reached ({used} used)")]
    LimitExceeded { quota: u32, used: u32 },
    #[error("already cancelled: {0}")]
    AlreadyCancelled(Ulid),
    #[error("already completed: {0}")]
    AlreadyCompleted(Ulid),
    #[error("cancellation window closed: {minutes_to_start} minutes to start")]
    CancellationWindowClosed { minutes_to_start: i64 },
    #[error("appointment has already started")]
    TooLateToCancel,
    #[error("trainer {0} is not accepting new clients")]
    Unavailable(Ulid),
    #[error("scheduling conflict with {0}")]
    SchedulingConflict(Ulid),
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(Ulid),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("service unavailable after {attempts} attempts")]
    ServiceUnavailable { attempts: usize },
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidInput(_) | EngineError::IllegalTransition { .. } => {
                ErrorClass::Validation
            }
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::AlreadyReserved(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::AlreadyCompleted(_)
            | EngineError::SchedulingConflict(_) => ErrorClass::Conflict,
            EngineError::Unauthenticated
            | EngineError::InactiveMember(_)
            | EngineError::TooLateToBook
            | EngineError::LimitExceeded { .. }
            | EngineError::CancellationWindowClosed { .. }
            | EngineError::TooLateToCancel
            | EngineError::Unavailable(_) => ErrorClass::Policy,
            EngineError::PaymentFailed(_)
            | EngineError::LockTimeout(_)
            | EngineError::Storage(_)
            | EngineError::ServiceUnavailable { .. } => ErrorClass::Transient,
        }
    }

    /// Failure kind as exposed to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::Unauthenticated => "Unauthenticated",
            EngineError::InactiveMember(_) => "InactiveMember",
            EngineError::NotFound(_) => "NotFound",
            EngineError::TooLateToBook => "TooLateToBook",
            EngineError::AlreadyReserved(_) => "AlreadyReserved",
            EngineError::LimitExceeded { .. } => "LimitExceeded",
            EngineError::AlreadyCancelled(_) => "AlreadyCancelled",
            EngineError::AlreadyCompleted(_) => "AlreadyCompleted",
            EngineError::CancellationWindowClosed { .. } => "CancellationWindowClosed",
            EngineError::TooLateToCancel => "TooLateToCancel",
            EngineError::Unavailable(_) => "Unavailable",
            EngineError::SchedulingConflict(_) => "SchedulingConflict",
            EngineError::IllegalTransition { .. } => "IllegalTransition",
            EngineError::PaymentFailed(_) => "PaymentFailed",
            EngineError::LockTimeout(_) | EngineError::Storage(_) => "TransientFailure",
            EngineError::ServiceUnavailable { .. } => "ServiceUnavailable",
        }
    }

    /// Retried inside the engine before surfacing. Payment failures are surfaced
    /// as retryable to the caller but never replayed here.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_) | EngineError::Storage(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<CalendarError> for EngineError {
    fn from(err: CalendarError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}

impl From<Unauthenticated> for EngineError {
    fn from(_: Unauthenticated) -> Self {
        EngineError::Unauthenticated
    }
}

impl From<PaymentError> for EngineError {
    fn from(err: PaymentError) -> Self {
        EngineError::PaymentFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(EngineError::InvalidInput("x".into()).class(), ErrorClass::Validation);
        assert_eq!(EngineError::NotFound(Ulid::new()).class(), ErrorClass::NotFound);
        assert_eq!(EngineError::SchedulingConflict(Ulid::new()).class(), ErrorClass::Conflict);
        assert_eq!(
            EngineError::CancellationWindowClosed { minutes_to_start: 30 }.class(),
            ErrorClass::Policy
        );
        assert_eq!(EngineError::LockTimeout(Ulid::new()).class(), ErrorClass::Transient);
    }

    #[test]
    fn only_infrastructure_failures_are_retried_internally() {
        assert!(EngineError::LockTimeout(Ulid::new()).is_transient());
        assert!(EngineError::Storage("disk".into()).is_transient());
        assert!(!EngineError::PaymentFailed("declined".into()).is_transient());
        assert!(EngineError::PaymentFailed("declined".into()).is_retryable());
        assert!(!EngineError::TooLateToBook.is_retryable());
    }

    #[test]
    fn codes_match_exposed_failure_kinds() {
        assert_eq!(EngineError::LimitExceeded { quota: 8, used: 8 }.code(), "LimitExceeded");
        assert_eq!(EngineError::TooLateToCancel.code(), "TooLateToCancel");
        assert_eq!(EngineError::ServiceUnavailable { attempts: 4 }.code(), "ServiceUnavailable");
    }
}
