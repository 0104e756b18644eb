//! Domain errors for loan-ledger-service.
//!
//! Every failure a ledger operation can produce falls into one of five classes.
//! Internal callers see the class as an HTTP status; payment network callbacks
//! never see it at all.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::LoanStatus;

/// Error classes used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. No state change.
    Validation,
    /// Unknown loan or event.
    NotFound,
    /// Duplicate key, already finalized or already initiated.
    Conflict,
    /// Postings that do not balance or schedule rows that disagree with the loan.
    /// A defect, never retried.
    Consistency,
    /// The payment network failed or rejected an outbound request.
    Upstream,
    /// Storage or other infrastructure failures.
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Consistency => "consistency",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Loan {0} not found")]
    LoanNotFound(Uuid),

    #[error("Payment event not found: {0}")]
    EventNotFound(String),

    #[error("Loan {loan_id} is {actual}, expected {expected}")]
    InvalidState {
        loan_id: Uuid,
        expected: &'static str,
        actual: LoanStatus,
    },

    #[error("Disbursement already initiated for loan {0}")]
    AlreadyInitiated(Uuid),

    #[error("Duplicate payment event: {0}")]
    DuplicateEvent(String),

    #[error("Payment event {0} is already finalized")]
    AlreadyFinalized(Uuid),

    #[error("Loan {0} cannot be approved by the actor who created it")]
    ApprovalConflict(Uuid),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Payment gateway error: {0}")]
    Gateway(anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount(_) | Self::Validation(_) => ErrorClass::Validation,
            Self::LoanNotFound(_) | Self::EventNotFound(_) => ErrorClass::NotFound,
            Self::InvalidState { .. }
            | Self::AlreadyInitiated(_)
            | Self::DuplicateEvent(_)
            | Self::AlreadyFinalized(_)
            | Self::ApprovalConflict(_) => ErrorClass::Conflict,
            Self::ConsistencyViolation(_) => ErrorClass::Consistency,
            Self::Gateway(_) => ErrorClass::Upstream,
            Self::Database(_) => ErrorClass::Internal,
        }
    }

    /// Whether repeating the same call may succeed or is a safe no-op.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitiated(_)
                | Self::DuplicateEvent(_)
                | Self::AlreadyFinalized(_)
                | Self::Gateway(_)
                | Self::Database(_)
        )
    }

    /// Map a unique-constraint violation to `on_conflict`, anything else via [`Self::from_db`].
    pub fn from_insert(err: sqlx::Error, on_conflict: impl FnOnce() -> LedgerError) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => on_conflict(),
            other => Self::from_db(other),
        }
    }

    /// Ledger trigger rejections become consistency violations.
    pub fn from_db(err: sqlx::Error) -> Self {
        match err {
            // Raised by the ledger triggers (SQLSTATE P0001 with our prefix).
            sqlx::Error::Database(ref db_err)
                if db_err.message().starts_with("ledger invariant:") =>
            {
                LedgerError::ConsistencyViolation(db_err.message().to_string())
            }
            other => LedgerError::Database(other),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err.class() {
            ErrorClass::Validation => AppError::BadRequest(anyhow::anyhow!(message)),
            ErrorClass::NotFound => AppError::NotFound(anyhow::anyhow!(message)),
            ErrorClass::Conflict => AppError::Conflict(anyhow::anyhow!(message)),
            ErrorClass::Upstream => AppError::BadGateway(message),
            ErrorClass::Consistency => {
                tracing::error!(error = %message, "Ledger consistency violation");
                AppError::InternalError(anyhow::anyhow!(message))
            }
            ErrorClass::Internal => AppError::DatabaseError(anyhow::anyhow!(message)),
        }
    }
}
